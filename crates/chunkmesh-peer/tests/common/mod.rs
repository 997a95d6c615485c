//! In-process mesh of peers for integration tests.
//!
//! Every peer gets its own store under a temporary directory. The three
//! group channels and direct delivery are replaced by a loopback bus that
//! hands each payload to every online peer, sender included, on its own task.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chunkmesh_peer::{Channels, LocalControl, PeerConfig, ReplicationEngine};
use chunkmesh_storage::{ChunkStore, PeerId};
use chunkmesh_transport::{DatagramHandler, DirectSend, GroupSend, Message, MessageKind, ProtocolVersion};
use tempfile::TempDir;

const BUS_PORT: u16 = 9000;

struct Member {
    addr: SocketAddr,
    engine: ReplicationEngine,
    online: Arc<AtomicBool>,
}

/// Loopback replacement for the multicast groups.
#[derive(Default)]
pub struct Bus {
    members: RwLock<Vec<Member>>,
    tap: Mutex<Vec<Message>>,
}

impl Bus {
    fn join(&self, addr: SocketAddr, engine: ReplicationEngine, online: Arc<AtomicBool>) {
        self.members.write().unwrap().push(Member { addr, engine, online });
    }

    fn online_members(&self) -> Vec<(SocketAddr, ReplicationEngine)> {
        self.members
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.online.load(Ordering::SeqCst))
            .map(|m| (m.addr, m.engine.clone()))
            .collect()
    }

    /// Every message sent to a group so far.
    pub fn messages(&self) -> Vec<Message> {
        self.tap.lock().unwrap().clone()
    }

    /// Group messages of `kind` sent by `sender`.
    pub fn sent_by(&self, sender: PeerId, kind: MessageKind) -> usize {
        self.messages()
            .iter()
            .filter(|m| m.kind() == Some(kind) && m.header().map(|h| h.sender) == Some(sender))
            .count()
    }
}

struct BusSender {
    bus: Arc<Bus>,
    from: SocketAddr,
}

#[async_trait]
impl GroupSend for BusSender {
    async fn send(&self, payload: Bytes) -> bool {
        self.bus.tap.lock().unwrap().push(Message::decode(&payload));
        for (_, engine) in self.bus.online_members() {
            let payload = payload.clone();
            let from = self.from;
            tokio::spawn(async move { engine.handle(payload, from).await });
        }
        true
    }
}

struct BusDirect {
    bus: Arc<Bus>,
}

#[async_trait]
impl DirectSend for BusDirect {
    async fn send_to(&self, addr: SocketAddr, payload: Bytes) -> bool {
        let target = self
            .bus
            .online_members()
            .into_iter()
            .find(|(member, _)| member.ip() == addr.ip());
        match target {
            Some((member, engine)) => {
                tokio::spawn(async move { engine.handle(payload, member).await });
                true
            }
            None => false,
        }
    }
}

/// One peer of the mesh.
pub struct TestPeer {
    pub id: PeerId,
    pub engine: ReplicationEngine,
    pub control: LocalControl,
    online: Arc<AtomicBool>,
    dir: TempDir,
}

impl TestPeer {
    pub fn store(&self) -> &Arc<ChunkStore> {
        self.engine.store()
    }

    /// Stop (or resume) receiving group traffic.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Write a local file for this peer to back up.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn restored(&self, name: &str) -> PathBuf {
        self.engine.config().restored_dir().join(name)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Timings short enough for tests that run on the real clock.
pub fn fast_config(id: PeerId, version: ProtocolVersion, data_dir: &Path) -> PeerConfig {
    PeerConfig {
        peer_id: id,
        protocol_version: version,
        data_dir: data_dir.to_path_buf(),
        jitter_max_ms: 20,
        backoff_initial_ms: 50,
        watchdog_delay_ms: 300,
        delete_interval_ms: 10,
        restore_timeout_ms: 10_000,
        ..Default::default()
    }
}

/// A set of peers sharing one bus.
pub struct Mesh {
    pub bus: Arc<Bus>,
    pub peers: Vec<TestPeer>,
}

impl Mesh {
    /// `n` peers with ids `1..=n`, all speaking `version`.
    pub fn new(n: u32, version: ProtocolVersion) -> Self {
        Self::with_versions(&vec![version; n as usize])
    }

    /// One peer per entry, ids starting at 1.
    pub fn with_versions(versions: &[ProtocolVersion]) -> Self {
        let bus = Arc::new(Bus::default());
        let peers = versions
            .iter()
            .enumerate()
            .map(|(i, version)| {
                let id = PeerId(i as u32 + 1);
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, id.0 as u8)), BUS_PORT);
                let dir = tempfile::tempdir().unwrap();
                let config = fast_config(id, *version, dir.path());
                let store = Arc::new(ChunkStore::open(config.store_config()).unwrap());

                let group = || -> Arc<dyn GroupSend> {
                    Arc::new(BusSender {
                        bus: Arc::clone(&bus),
                        from: addr,
                    })
                };
                let channels = Channels {
                    control: group(),
                    backup: group(),
                    restore: group(),
                    direct: Arc::new(BusDirect { bus: Arc::clone(&bus) }),
                };
                let engine = ReplicationEngine::new(config, store, channels);
                let online = Arc::new(AtomicBool::new(true));
                bus.join(addr, engine.clone(), Arc::clone(&online));

                TestPeer {
                    id,
                    control: LocalControl::new(engine.clone()),
                    engine,
                    online,
                    dir,
                }
            })
            .collect();
        Self { bus, peers }
    }

    /// Peer with id `id`.
    pub fn peer(&self, id: u32) -> &TestPeer {
        &self.peers[id as usize - 1]
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic file contents.
pub fn contents(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
