use anyhow::Result;
use chunkmesh_peer::{Cli, ConsoleCommand, Peer};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    tracing::info!(peer = %config.peer_id, version = %config.protocol_version, "chunkmesh peer starting");

    let peer = Peer::start(config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if console_open => {
                let Some(line) = line? else {
                    console_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match ConsoleCommand::parse(&line) {
                    Ok(command) => command.execute(peer.control()).await,
                    Err(e) => Err(e),
                };
                match reply {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    peer.shutdown();
    Ok(())
}
