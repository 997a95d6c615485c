//! Command line and operator console of the `cm-peer` binary.

use std::path::PathBuf;

use chunkmesh_storage::PeerId;
use chunkmesh_transport::ProtocolVersion;
use clap::Parser;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::control::LocalControlSurface;
use crate::error::{PeerError, Result};

/// Command line of the peer daemon.
#[derive(Debug, Parser)]
#[command(name = "cm-peer")]
#[command(about = "chunkmesh backup peer", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "CHUNKMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Peer id, overrides the configuration file.
    #[arg(short, long)]
    pub peer_id: Option<PeerId>,

    /// Protocol version, e.g. 1.0 or 2.0.
    #[arg(short = 'v', long)]
    pub protocol_version: Option<ProtocolVersion>,

    /// Parent directory of the peer state directory.
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

impl Cli {
    /// Load the configuration file, if any, and apply command line overrides.
    pub fn load_config(&self) -> Result<PeerConfig> {
        let mut config = match &self.config {
            Some(path) => PeerConfig::from_file(path)?,
            None => PeerConfig::default(),
        };
        if let Some(peer_id) = self.peer_id {
            config.peer_id = peer_id;
        }
        if let Some(version) = self.protocol_version {
            config.protocol_version = version;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

/// One line typed at the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `BACKUP <path> <degree>`
    Backup {
        /// File to back up.
        path: PathBuf,
        /// Desired replication degree.
        degree: u32,
    },
    /// `RESTORE <path>`
    Restore {
        /// File to restore.
        path: PathBuf,
    },
    /// `DELETE <path>`
    Delete {
        /// File to delete.
        path: PathBuf,
    },
    /// `RECLAIM <bytes>`
    Reclaim {
        /// New storage budget.
        max_bytes: u64,
    },
    /// `STATE`
    State,
}

impl ConsoleCommand {
    /// Parse a console line. The operation name is case-insensitive.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let op = tokens
            .next()
            .ok_or_else(|| invalid("empty command"))?
            .to_ascii_uppercase();
        let args: Vec<&str> = tokens.collect();

        let command = match (op.as_str(), args.as_slice()) {
            ("BACKUP", [path, degree]) => ConsoleCommand::Backup {
                path: PathBuf::from(path),
                degree: degree
                    .parse()
                    .map_err(|_| invalid(format!("bad replication degree: {}", degree)))?,
            },
            ("RESTORE", [path]) => ConsoleCommand::Restore {
                path: PathBuf::from(path),
            },
            ("DELETE", [path]) => ConsoleCommand::Delete {
                path: PathBuf::from(path),
            },
            ("RECLAIM", [bytes]) => ConsoleCommand::Reclaim {
                max_bytes: bytes
                    .parse()
                    .map_err(|_| invalid(format!("bad byte count: {}", bytes)))?,
            },
            ("STATE", []) => ConsoleCommand::State,
            ("BACKUP" | "RESTORE" | "DELETE" | "RECLAIM" | "STATE", _) => {
                return Err(invalid(format!("wrong number of arguments for {}", op)))
            }
            _ => return Err(invalid(format!("unknown command: {}", op))),
        };
        Ok(command)
    }

    /// Run the command against `control`, returning the text to print.
    ///
    /// Backup and restore return once the exchange is launched; their
    /// outcome is logged when it completes.
    pub async fn execute<C>(self, control: &C) -> Result<String>
    where
        C: LocalControlSurface + ?Sized,
    {
        match self {
            ConsoleCommand::Backup { path, degree } => {
                let handle = control.backup(&path, degree).await?;
                let reply = format!(
                    "backing up {} as {} ({} chunks)",
                    path.display(),
                    handle.file_id,
                    handle.chunk_count
                );
                tokio::spawn(async move {
                    let chunks = handle.chunk_count;
                    let file_id = handle.file_id.clone();
                    let satisfied = handle.finished().await;
                    info!(file = %file_id, satisfied, chunks, "backup finished");
                });
                Ok(reply)
            }
            ConsoleCommand::Restore { path } => {
                let handle = control.restore(&path).await?;
                let reply = format!("restoring {} to {}", path.display(), handle.destination().display());
                tokio::spawn(async move {
                    let destination = handle.destination().to_path_buf();
                    if !handle.finished().await {
                        warn!(path = %destination.display(), "restore incomplete");
                    }
                });
                Ok(reply)
            }
            ConsoleCommand::Delete { path } => {
                let file_id = control.delete(&path).await?;
                Ok(format!("deleting {} ({})", path.display(), file_id))
            }
            ConsoleCommand::Reclaim { max_bytes } => {
                let evicted = control.reclaim(max_bytes).await?;
                Ok(format!("budget set to {} bytes, {} chunks evicted", max_bytes, evicted.len()))
            }
            ConsoleCommand::State => Ok(control.state().to_string()),
        }
    }
}

fn invalid(reason: impl Into<String>) -> PeerError {
    PeerError::InvalidArgument {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ConsoleCommand::parse("BACKUP notes.txt 2").unwrap(),
            ConsoleCommand::Backup {
                path: PathBuf::from("notes.txt"),
                degree: 2
            }
        );
        assert_eq!(
            ConsoleCommand::parse("  restore  /tmp/a.bin ").unwrap(),
            ConsoleCommand::Restore {
                path: PathBuf::from("/tmp/a.bin")
            }
        );
        assert_eq!(
            ConsoleCommand::parse("DELETE a").unwrap(),
            ConsoleCommand::Delete {
                path: PathBuf::from("a")
            }
        );
        assert_eq!(
            ConsoleCommand::parse("RECLAIM 0").unwrap(),
            ConsoleCommand::Reclaim { max_bytes: 0 }
        );
        assert_eq!(ConsoleCommand::parse("state").unwrap(), ConsoleCommand::State);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        for line in ["", "BACKUP a", "BACKUP a two", "RECLAIM -5", "STATE now", "FORMAT c:"] {
            assert!(
                matches!(ConsoleCommand::parse(line), Err(PeerError::InvalidArgument { .. })),
                "accepted {:?}",
                line
            );
        }
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["cm-peer", "--peer-id", "4", "-v", "1.3", "--data-dir", "/srv/mesh"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.peer_id, PeerId(4));
        assert_eq!(config.protocol_version, ProtocolVersion::new(1, 3));
        assert_eq!(config.data_dir, PathBuf::from("/srv/mesh"));
        assert_eq!(config.max_storage_bytes, PeerConfig::default().max_storage_bytes);
    }

    #[test]
    fn test_cli_rejects_bad_version() {
        assert!(Cli::try_parse_from(["cm-peer", "--protocol-version", "x"]).is_err());
    }
}
