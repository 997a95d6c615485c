//! Protocol message dispatch.
//!
//! `ReplicationEngine` is a cheap-to-clone handle over shared state: the
//! chunk store, the outbound channels, the active restore sessions and two
//! transient maps that are never persisted:
//!
//! - `backup_requests`: held chunks with a PUTCHUNK exchange in flight,
//!   counting the PUTCHUNK observations. Cleared once the perceived degree
//!   reaches the desired one, or when this peer declines the chunk.
//! - `answered`: chunks for which another peer's CHUNK reply was seen, used to
//!   suppress duplicate GETCHUNK responses.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chunkmesh_storage::{ChunkId, ChunkStore, FileId, PeerId};
use chunkmesh_transport::{
    jitter_delay, DatagramHandler, DirectSend, GroupSend, Header, Message, ProtocolVersion,
};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::restorer::{FeedOutcome, FileRestorer};

/// Outbound senders used by the engine.
#[derive(Clone)]
pub struct Channels {
    /// Control group.
    pub control: Arc<dyn GroupSend>,
    /// Backup group.
    pub backup: Arc<dyn GroupSend>,
    /// Restore group.
    pub restore: Arc<dyn GroupSend>,
    /// Direct delivery for CHUNK replies under the restore enhancement.
    pub direct: Arc<dyn DirectSend>,
}

pub(crate) struct EngineInner {
    pub(crate) config: PeerConfig,
    pub(crate) store: Arc<ChunkStore>,
    pub(crate) channels: Channels,
    pub(crate) sessions: DashMap<FileId, Arc<FileRestorer>>,
    pub(crate) backup_requests: DashMap<ChunkId, u32>,
    pub(crate) answered: DashMap<ChunkId, ()>,
}

/// Replication protocol engine for one peer.
#[derive(Clone)]
pub struct ReplicationEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl ReplicationEngine {
    /// Create an engine over `store`, sending through `channels`.
    pub fn new(config: PeerConfig, store: Arc<ChunkStore>, channels: Channels) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                channels,
                sessions: DashMap::new(),
                backup_requests: DashMap::new(),
                answered: DashMap::new(),
            }),
        }
    }

    /// This peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.inner.config.peer_id
    }

    /// Protocol version this peer speaks.
    pub fn version(&self) -> ProtocolVersion {
        self.inner.config.protocol_version
    }

    /// Peer configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// The chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.inner.store
    }

    pub(crate) fn header(&self) -> Header {
        Header::new(self.version(), self.peer_id())
    }

    /// PUTCHUNK observations for `chunk`, `None` if no exchange is in flight.
    pub fn backup_requests(&self, chunk: &ChunkId) -> Option<u32> {
        self.inner.backup_requests.get(chunk).map(|count| *count)
    }

    // ---------------------------------------------------------------------
    // Restore sessions
    // ---------------------------------------------------------------------

    /// Start (or replace) the restore session for `file_id`.
    ///
    /// The session is discarded if it has not completed within the configured
    /// restore timeout.
    pub fn open_session(&self, file_id: FileId, destination: PathBuf) -> Arc<FileRestorer> {
        let session = Arc::new(FileRestorer::new(file_id.clone(), destination));
        self.inner.sessions.insert(file_id.clone(), Arc::clone(&session));

        let engine = self.clone();
        let watched = Arc::clone(&session);
        let timeout = self.inner.config.restore_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = engine
                .inner
                .sessions
                .remove_if(&file_id, |_, current| Arc::ptr_eq(current, &watched) && !current.is_complete())
                .is_some();
            if expired {
                warn!(
                    file = %file_id,
                    collected = watched.collected(),
                    expected = ?watched.expected_count(),
                    "restore session timed out"
                );
            }
        });
        session
    }

    /// The active restore session for `file_id`.
    pub fn session(&self, file_id: &FileId) -> Option<Arc<FileRestorer>> {
        self.inner.sessions.get(file_id).map(|s| Arc::clone(s.value()))
    }

    /// Number of active restore sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Handle one decoded message received from `from`.
    pub async fn dispatch(&self, message: Message, from: SocketAddr) {
        let Some(header) = message.header().copied() else {
            if let Message::Malformed { reason } = &message {
                warn!(peer = %self.peer_id(), %from, %reason, "dropping malformed message");
            }
            return;
        };
        if header.sender == self.peer_id() {
            return;
        }

        match message {
            Message::PutChunk {
                chunk,
                desired_degree,
                body,
                ..
            } => self.on_putchunk(header, chunk, desired_degree, body).await,
            Message::Stored { chunk, .. } => self.on_stored(header, chunk),
            Message::GetChunk { chunk, .. } => self.on_getchunk(header, chunk, from).await,
            Message::Chunk { chunk, body, .. } => self.on_chunk(header, chunk, body),
            Message::Delete { file_id, .. } => self.on_delete(header, file_id).await,
            Message::Deleted { chunk, .. } => self.on_deleted(header, chunk),
            Message::Removed { chunk, .. } => self.on_removed(header, chunk).await,
            Message::Ahoy { .. } => self.on_ahoy(header),
            Message::Unknown { kind, .. } => {
                warn!(peer = %self.peer_id(), from = %header.sender, %kind, "ignoring unknown message type");
            }
            Message::Malformed { .. } => {}
        }
    }

    async fn on_putchunk(&self, header: Header, chunk: ChunkId, desired_degree: u32, body: Bytes) {
        debug!(peer = %self.peer_id(), from = %header.sender, %chunk, "PUTCHUNK received");
        let store = &self.inner.store;
        if store.is_own_file(&chunk.file_id) {
            return;
        }
        if !store.has_chunk(&chunk) && !store.has_room_for(body.len()) {
            debug!(
                peer = %self.peer_id(),
                %chunk,
                occupied = store.occupied_bytes(),
                "no space for chunk"
            );
            return;
        }

        let first = {
            let mut count = self.inner.backup_requests.entry(chunk.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        let outcome = match store
            .store_chunk(&chunk, desired_degree, &body, header.version.backup_enhanced())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(peer = %self.peer_id(), %chunk, error = %e, "failed to store chunk");
                self.inner.backup_requests.remove(&chunk);
                return;
            }
        };
        if !outcome.is_held() {
            self.inner.backup_requests.remove(&chunk);
            return;
        }
        if first && self.version().backup_enhanced() {
            let engine = self.clone();
            let watched = chunk.clone();
            tokio::spawn(async move { engine.track_backup(watched).await });
        }

        self.send_control(Message::Stored {
            header: self.header(),
            chunk: chunk.clone(),
        })
        .await;
        store.record_stored(&chunk, self.peer_id());
        self.clear_if_satisfied(&chunk);
    }

    fn on_stored(&self, header: Header, chunk: ChunkId) {
        self.inner.store.record_stored(&chunk, header.sender);
        self.clear_if_satisfied(&chunk);
    }

    /// Drop the in-flight backup record once the desired degree is observed.
    fn clear_if_satisfied(&self, chunk: &ChunkId) {
        let store = &self.inner.store;
        let satisfied = match (store.perceived_degree(chunk), store.desired_degree(&chunk.file_id)) {
            (Some(perceived), Some(desired)) => perceived >= desired as usize,
            _ => false,
        };
        if satisfied {
            self.inner.backup_requests.remove(chunk);
        }
    }

    async fn on_getchunk(&self, header: Header, chunk: ChunkId, from: SocketAddr) {
        if !self.inner.store.has_chunk(&chunk) {
            return;
        }
        self.inner.answered.remove(&chunk);
        self.send_chunk(header, chunk, from).await;
    }

    /// Reply to a GETCHUNK after a random delay, unless another peer answered first.
    async fn send_chunk(&self, request: Header, chunk: ChunkId, from: SocketAddr) {
        let body = match self.inner.store.read_chunk(&chunk) {
            Ok(body) => body,
            Err(e) => {
                warn!(peer = %self.peer_id(), %chunk, error = %e, "cannot read chunk for reply");
                return;
            }
        };
        let payload = Message::Chunk {
            header: self.header(),
            chunk: chunk.clone(),
            body,
        }
        .encode();

        tokio::time::sleep(jitter_delay(self.inner.config.jitter_max())).await;
        if self.inner.answered.remove(&chunk).is_some() {
            debug!(peer = %self.peer_id(), %chunk, "another peer answered first");
            return;
        }

        if request.version.restore_enhanced() {
            let port = match self.inner.config.direct_port() {
                Ok(port) => port,
                Err(e) => {
                    warn!(error = %e, "no direct port configured");
                    return;
                }
            };
            let target = SocketAddr::new(from.ip(), port);
            self.inner.channels.direct.send_to(target, payload).await;
        } else {
            self.inner.channels.restore.send(payload).await;
        }
        debug!(peer = %self.peer_id(), %chunk, to = %request.sender, "CHUNK sent");
    }

    fn on_chunk(&self, header: Header, chunk: ChunkId, body: Bytes) {
        let Some(session) = self.session(&chunk.file_id) else {
            if self.inner.store.has_chunk(&chunk) {
                self.inner.answered.insert(chunk, ());
            }
            return;
        };

        match session.feed(chunk.chunk_no, body) {
            Ok(FeedOutcome::Completed(path)) => {
                self.inner
                    .sessions
                    .remove_if(&chunk.file_id, |_, current| Arc::ptr_eq(current, &session));
                info!(peer = %self.peer_id(), file = %chunk.file_id, path = %path.display(), "restore complete");
            }
            Ok(FeedOutcome::Collected) => {
                debug!(peer = %self.peer_id(), from = %header.sender, %chunk, "chunk collected");
            }
            Ok(FeedOutcome::Ignored) => {}
            Err(e) => {
                warn!(peer = %self.peer_id(), file = %chunk.file_id, error = %e, "failed to write restored file");
                self.inner
                    .sessions
                    .remove_if(&chunk.file_id, |_, current| Arc::ptr_eq(current, &session));
            }
        }
    }

    async fn on_delete(&self, header: Header, file_id: FileId) {
        let removed = self.inner.store.delete_file(&file_id);
        self.inner
            .backup_requests
            .retain(|chunk, _| chunk.file_id != file_id);
        if removed.is_empty() || !header.version.delete_enhanced() {
            return;
        }
        for chunk_no in removed {
            self.send_control(Message::Deleted {
                header: self.header(),
                chunk: ChunkId::new(file_id.clone(), chunk_no),
            })
            .await;
        }
    }

    fn on_deleted(&self, header: Header, chunk: ChunkId) {
        if self.inner.store.record_deleted(&chunk, header.sender) {
            debug!(peer = %self.peer_id(), %chunk, "deletion acknowledged by all holders");
        }
    }

    async fn on_removed(&self, header: Header, chunk: ChunkId) {
        let store = &self.inner.store;
        if !store.record_removed(&chunk, header.sender) || !store.has_chunk(&chunk) {
            return;
        }
        let (Some(desired), Some(perceived)) =
            (store.desired_degree(&chunk.file_id), store.perceived_degree(&chunk))
        else {
            return;
        };

        if perceived >= desired as usize {
            self.inner.backup_requests.remove(&chunk);
            return;
        }

        info!(
            peer = %self.peer_id(),
            %chunk,
            perceived,
            desired,
            "replication below desired degree"
        );
        tokio::time::sleep(jitter_delay(self.inner.config.jitter_max())).await;
        if self.inner.backup_requests.contains_key(&chunk) {
            debug!(peer = %self.peer_id(), %chunk, "another peer is already repairing");
            return;
        }
        let data = match store.read_chunk(&chunk) {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %self.peer_id(), %chunk, error = %e, "cannot read chunk for repair");
                return;
            }
        };

        self.spawn_chunk_backup(chunk.clone(), desired, data);
        if self.version().backup_enhanced() {
            let engine = self.clone();
            tokio::spawn(async move { engine.track_backup(chunk).await });
        }
    }

    fn on_ahoy(&self, header: Header) {
        if !self.version().delete_enhanced() {
            return;
        }
        for file_id in self.inner.store.files_pending_deletion_for(header.sender) {
            info!(peer = %self.peer_id(), to = %header.sender, file = %file_id, "re-issuing DELETE");
            let engine = self.clone();
            tokio::spawn(async move { engine.broadcast_delete(file_id).await });
        }
    }

    pub(crate) async fn send_control(&self, message: Message) -> bool {
        let sent = self.inner.channels.control.send(message.encode()).await;
        if sent {
            debug!(peer = %self.peer_id(), kind = ?message.kind(), "sent");
        }
        sent
    }
}

#[async_trait]
impl DatagramHandler for ReplicationEngine {
    async fn handle(&self, payload: Bytes, from: SocketAddr) {
        self.dispatch(Message::decode(&payload), from).await;
    }
}
