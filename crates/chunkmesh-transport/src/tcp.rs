//! Direct TCP delivery of single messages.
//!
//! With the restore enhancement a CHUNK reply goes straight to the requester
//! instead of the restore group. Each connection carries exactly one encoded
//! message: the sender writes it and shuts the stream down, the receiver
//! reads to EOF.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chunkmesh_storage::CHUNK_SIZE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{DatagramHandler, DirectSend};
use crate::error::Result;
use crate::pool::WorkerPool;

/// Upper bound on one message: a full chunk plus generous header room.
const MAX_MESSAGE_SIZE: u64 = CHUNK_SIZE as u64 + 1024;

/// Connect timeout of the sender and read deadline of the listener.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens one connection per message.
#[derive(Debug, Clone)]
pub struct TcpDirectSender {
    connect_timeout: Duration,
}

impl Default for TcpDirectSender {
    fn default() -> Self {
        Self::new(IO_TIMEOUT)
    }
}

impl TcpDirectSender {
    /// Create a sender with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn deliver(&self, addr: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl DirectSend for TcpDirectSender {
    async fn send_to(&self, addr: SocketAddr, payload: Bytes) -> bool {
        match self.deliver(addr, &payload).await {
            Ok(()) => {
                debug!(%addr, bytes = payload.len(), "direct delivery");
                true
            }
            Err(e) => {
                warn!(%addr, error = %e, "direct delivery failed");
                false
            }
        }
    }
}

/// Accepts direct deliveries and feeds them to a handler.
#[derive(Debug)]
pub struct DirectListener {
    listener: TcpListener,
    read_timeout: Duration,
}

impl DirectListener {
    /// Listen on all interfaces at `port`. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        info!(addr = %listener.local_addr()?, "direct listener bound");
        Ok(Self {
            listener,
            read_timeout: IO_TIMEOUT,
        })
    }

    /// Deadline for reading one connection to EOF.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop. Reading and handling each connection runs on `pool`.
    pub fn start<H>(self, handler: Arc<H>, pool: WorkerPool) -> JoinHandle<()>
    where
        H: DatagramHandler + ?Sized,
    {
        let read_timeout = self.read_timeout;
        tokio::spawn(async move {
            loop {
                let (stream, from) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                let accepted = pool.submit(async move {
                    match read_message(stream, read_timeout).await {
                        Ok(payload) => handler.handle(payload, from).await,
                        Err(e) => warn!(%from, error = %e, "failed to read direct delivery"),
                    }
                });
                if !accepted {
                    warn!(%from, "worker queue full, dropping direct delivery");
                }
            }
        })
    }
}

async fn read_message(stream: TcpStream, deadline: Duration) -> std::io::Result<Bytes> {
    let mut payload = Vec::new();
    tokio::time::timeout(deadline, stream.take(MAX_MESSAGE_SIZE).read_to_end(&mut payload))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))??;
    Ok(Bytes::from(payload))
}
