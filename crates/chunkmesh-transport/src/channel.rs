//! UDP multicast group channels.
//!
//! A peer joins three groups: control (STORED, GETCHUNK, DELETE, DELETED,
//! REMOVED, AHOY), backup (PUTCHUNK) and restore (CHUNK). Each channel owns
//! one socket, one receive loop and a `WorkerPool` that runs the handler, so
//! the loop only ever reads datagrams and never waits on handler work.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::pool::WorkerPool;

/// Largest datagram the receive loop accepts: a full chunk plus its header.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Which of the three groups a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Control messages.
    Control,
    /// PUTCHUNK traffic.
    Backup,
    /// CHUNK traffic.
    Restore,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Control => "control",
            ChannelKind::Backup => "backup",
            ChannelKind::Restore => "restore",
        })
    }
}

/// Best-effort group send.
#[async_trait]
pub trait GroupSend: Send + Sync {
    /// Send one datagram to the group. False on transport error; never retries.
    async fn send(&self, payload: Bytes) -> bool;
}

/// Best-effort point-to-point send.
#[async_trait]
pub trait DirectSend: Send + Sync {
    /// Deliver one message to `addr`. False on transport error.
    async fn send_to(&self, addr: SocketAddr, payload: Bytes) -> bool;
}

/// Receives inbound datagrams from a channel.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Handle one datagram and the address it came from.
    async fn handle(&self, payload: Bytes, from: SocketAddr);
}

/// Socket parameters for one group.
#[derive(Debug, Clone)]
pub struct GroupChannelConfig {
    /// Which group this is.
    pub kind: ChannelKind,
    /// Group address and port.
    pub group: SocketAddrV4,
    /// Local interface to join on.
    pub interface: Ipv4Addr,
    /// Multicast TTL.
    pub ttl: u32,
    /// Deliver our own datagrams back to us. Receivers discard them by sender id.
    pub loopback: bool,
}

impl GroupChannelConfig {
    /// Create a config for `group`, joined on any interface.
    pub fn new(kind: ChannelKind, group: SocketAddrV4) -> Self {
        Self {
            kind,
            group,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
        }
    }

    /// Parse and validate an `ip:port` multicast group address.
    pub fn parse_group(addr: &str) -> Result<SocketAddrV4> {
        let group: SocketAddrV4 =
            addr.parse()
                .map_err(|e: std::net::AddrParseError| TransportError::InvalidGroupAddress {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
        if !group.ip().is_multicast() {
            return Err(TransportError::NotMulticast {
                addr: addr.to_string(),
            });
        }
        Ok(group)
    }
}

/// Per-channel traffic counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

/// Point-in-time copy of `ChannelStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    /// Datagrams read from the socket.
    pub received: u64,
    /// Datagrams handed to the worker pool.
    pub dispatched: u64,
    /// Datagrams dropped because the pool was full.
    pub dropped: u64,
    /// Datagrams sent.
    pub sent: u64,
    /// Sends that failed.
    pub send_errors: u64,
}

impl ChannelStats {
    /// Record a datagram read from the socket.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the pool accepting (`true`) or rejecting a datagram.
    pub fn record_dispatch(&self, accepted: bool) {
        if accepted {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a send attempt and whether it succeeded.
    pub fn record_send(&self, ok: bool) {
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// A joined multicast group.
#[derive(Debug, Clone)]
pub struct GroupChannel {
    kind: ChannelKind,
    group: SocketAddrV4,
    socket: Arc<UdpSocket>,
    stats: Arc<ChannelStats>,
}

impl GroupChannel {
    /// Bind the group port with address reuse and join the group.
    ///
    /// Several peers on one host can bind the same group port this way.
    pub fn bind(config: &GroupChannelConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port());
        socket.bind(&SockAddr::from(bind_addr))?;
        socket.join_multicast_v4(config.group.ip(), &config.interface)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(config.loopback)?;
        if !config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface)?;
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        info!(channel = %config.kind, group = %config.group, "joined multicast group");

        Ok(Self::from_socket(config.kind, config.group, socket))
    }

    fn from_socket(kind: ChannelKind, group: SocketAddrV4, socket: UdpSocket) -> Self {
        Self {
            kind,
            group,
            socket: Arc::new(socket),
            stats: Arc::new(ChannelStats::default()),
        }
    }

    /// Which group this channel serves.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// The group address.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Traffic counters.
    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the receive loop.
    ///
    /// Every datagram is submitted to `pool`; when the pool is full the
    /// datagram is dropped and counted. The loop runs until the task is aborted.
    pub fn start_receiving<H>(&self, handler: Arc<H>, pool: WorkerPool) -> JoinHandle<()>
    where
        H: DatagramHandler + ?Sized,
    {
        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let kind = self.kind;

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        stats.record_received();
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        let handler = Arc::clone(&handler);
                        let accepted = pool.submit(async move {
                            handler.handle(payload, from).await;
                        });
                        stats.record_dispatch(accepted);
                        if !accepted {
                            warn!(channel = %kind, %from, "worker queue full, dropping datagram");
                        }
                    }
                    Err(e) => {
                        error!(channel = %kind, error = %e, "receive failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl GroupSend for GroupChannel {
    async fn send(&self, payload: Bytes) -> bool {
        let result = self.socket.send_to(&payload, self.group).await;
        self.stats.record_send(result.is_ok());
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(channel = %self.kind, error = %e, "group send failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder {
        seen: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    }

    #[async_trait]
    impl DatagramHandler for Recorder {
        async fn handle(&self, payload: Bytes, from: SocketAddr) {
            let _ = self.seen.send((payload, from));
        }
    }

    struct Blocked {
        gate: Arc<Semaphore>,
        handled: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl DatagramHandler for Blocked {
        async fn handle(&self, payload: Bytes, _from: SocketAddr) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let _ = self.handled.send(payload);
        }
    }

    async fn loopback_channel(kind: ChannelKind, group: SocketAddrV4) -> (GroupChannel, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (GroupChannel::from_socket(kind, group, socket), addr)
    }

    async fn wait_for_stats<F>(channel: &GroupChannel, condition: F) -> ChannelStatsSnapshot
    where
        F: Fn(&ChannelStatsSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let stats = channel.stats();
            if condition(&stats) || tokio::time::Instant::now() >= deadline {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_receive_loop_dispatches_to_handler() {
        let group = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 15), 8001);
        let (channel, addr) = loopback_channel(ChannelKind::Control, group).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = channel.start_receiving(Arc::new(Recorder { seen: tx }), WorkerPool::new("control", 2, 4));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        client.send_to(b"STORED 1.0 2 abc 0\r\n\r\n", addr).await.unwrap();

        let (payload, from) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&payload[..], b"STORED 1.0 2 abc 0\r\n\r\n");
        assert_eq!(from, client_addr);

        let stats = wait_for_stats(&channel, |s| s.dispatched == 1).await;
        assert_eq!(stats.received, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.dropped, 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_blocked_handler_does_not_stall_reception() {
        let group = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 16), 8002);
        let (channel, addr) = loopback_channel(ChannelKind::Backup, group).await;
        let gate = Arc::new(Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Blocked {
            gate: Arc::clone(&gate),
            handled: tx,
        });
        let pool = WorkerPool::new("backup", 1, 0);
        let task = channel.start_receiving(handler, pool.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"first", addr).await.unwrap();
        let stats = wait_for_stats(&channel, |s| s.dispatched == 1).await;
        assert_eq!(stats.dispatched, 1);

        for payload in [&b"second"[..], b"third", b"fourth"] {
            client.send_to(payload, addr).await.unwrap();
        }
        let stats = wait_for_stats(&channel, |s| s.received == 4).await;
        assert_eq!(stats.received, 4);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.dropped, 3);

        gate.add_permits(1);
        let handled = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&handled[..], b"first");
        let deadline = tokio::time::Instant::now() + WAIT;
        while pool.available() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.send_to(b"fifth", addr).await.unwrap();
        let stats = wait_for_stats(&channel, |s| s.received == 5 && s.dispatched == 2).await;
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.dropped, 3);
        task.abort();
    }

    #[tokio::test]
    async fn test_group_send_counts_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = match receiver.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };
        let (channel, _) = loopback_channel(ChannelKind::Restore, target).await;

        assert!(channel.send(Bytes::from_static(b"CHUNK")).await);
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(WAIT, receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"CHUNK");
        assert_eq!(channel.stats().sent, 1);
        assert_eq!(channel.stats().send_errors, 0);
    }

    #[test]
    fn test_parse_group() {
        let group = GroupChannelConfig::parse_group("224.0.0.15:8001").unwrap();
        assert_eq!(group.port(), 8001);
        assert!(matches!(
            GroupChannelConfig::parse_group("10.0.0.1:8001"),
            Err(TransportError::NotMulticast { .. })
        ));
        assert!(matches!(
            GroupChannelConfig::parse_group("not-an-address"),
            Err(TransportError::InvalidGroupAddress { .. })
        ));
    }

    #[test]
    fn test_stats_counters() {
        let stats = ChannelStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_dispatch(true);
        stats.record_dispatch(false);
        stats.record_send(true);
        stats.record_send(false);

        assert_eq!(
            stats.snapshot(),
            ChannelStatsSnapshot {
                received: 2,
                dispatched: 1,
                dropped: 1,
                sent: 1,
                send_errors: 1,
            }
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ChannelKind::Control.to_string(), "control");
        assert_eq!(ChannelKind::Backup.to_string(), "backup");
        assert_eq!(ChannelKind::Restore.to_string(), "restore");
    }
}
