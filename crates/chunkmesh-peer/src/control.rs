//! Local control surface: the operations a client drives on its own peer.
//!
//! Each operation validates its input, updates local bookkeeping and then
//! launches the protocol exchange as independent tasks. The returned handles
//! let a caller wait for the exchange, but nothing requires it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chunkmesh_storage::{split_chunks, ChunkId, FileId, OwnedFile};
use chunkmesh_transport::{GroupChannel, Message, RetryOutcome};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::ReplicationEngine;
use crate::error::{PeerError, Result};
use crate::restorer::FileRestorer;
use crate::state::PeerState;

/// Operations exposed to a local client.
#[async_trait]
pub trait LocalControlSurface: Send + Sync {
    /// Chunk the file at `path` and push every chunk to `desired_degree` peers.
    async fn backup(&self, path: &Path, desired_degree: u32) -> Result<BackupHandle>;

    /// Fetch every chunk of a previously backed-up file and reassemble it.
    async fn restore(&self, path: &Path) -> Result<RestoreHandle>;

    /// Ask every peer to drop the chunks of a previously backed-up file.
    async fn delete(&self, path: &Path) -> Result<FileId>;

    /// Set the local storage budget, evicting chunks until it fits.
    async fn reclaim(&self, max_bytes: u64) -> Result<Vec<ChunkId>>;

    /// Read-only report of this peer's files, chunks and space.
    fn state(&self) -> PeerState;
}

/// Running backup of one file.
#[derive(Debug)]
pub struct BackupHandle {
    /// Identifier the file was registered under.
    pub file_id: FileId,
    /// Number of chunks pushed.
    pub chunk_count: u32,
    tasks: Vec<JoinHandle<RetryOutcome>>,
}

impl BackupHandle {
    /// Wait for every chunk's retry loop. Returns how many reached the desired degree.
    pub async fn finished(self) -> usize {
        let mut satisfied = 0;
        for task in self.tasks {
            match task.await {
                Ok(outcome) if outcome.is_satisfied() => satisfied += 1,
                Ok(_) => {}
                Err(e) => warn!(file = %self.file_id, error = %e, "backup task failed"),
            }
        }
        satisfied
    }
}

/// Running restore of one file.
#[derive(Debug)]
pub struct RestoreHandle {
    /// Reassembly session fed by incoming CHUNK messages.
    pub session: Arc<FileRestorer>,
    tasks: Vec<JoinHandle<RetryOutcome>>,
}

impl RestoreHandle {
    /// Where the file is written once complete.
    pub fn destination(&self) -> &Path {
        self.session.destination()
    }

    /// Wait for every GETCHUNK retry loop. Returns true if the file was restored.
    pub async fn finished(self) -> bool {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(file = %self.session.file_id(), error = %e, "restore task failed");
            }
        }
        self.session.is_complete()
    }
}

/// `LocalControlSurface` over a replication engine.
#[derive(Clone)]
pub struct LocalControl {
    engine: ReplicationEngine,
    channels: Vec<GroupChannel>,
}

impl LocalControl {
    /// Control surface without channel statistics.
    pub fn new(engine: ReplicationEngine) -> Self {
        Self {
            engine,
            channels: Vec::new(),
        }
    }

    /// Control surface whose `state()` report includes `channels`' counters.
    pub fn with_channels(engine: ReplicationEngine, channels: Vec<GroupChannel>) -> Self {
        Self { engine, channels }
    }

    /// The engine behind this surface.
    pub fn engine(&self) -> &ReplicationEngine {
        &self.engine
    }

    /// FileId of a file this peer backed up, looked up by its registered path.
    /// A file whose DELETE handshake is still pending resolves by its current
    /// on-disk identity.
    fn resolve_for_delete(&self, path: &Path) -> Result<FileId> {
        let store = self.engine.store();
        if let Some(owned) = store.owned_file_by_path(path) {
            return Ok(owned.file_id);
        }
        match FileId::for_path(path) {
            Ok(file_id) if store.is_marked_for_deletion(&file_id) => Ok(file_id),
            _ => Err(PeerError::FileNotOwned {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[async_trait]
impl LocalControlSurface for LocalControl {
    async fn backup(&self, path: &Path, desired_degree: u32) -> Result<BackupHandle> {
        if desired_degree < 1 {
            return Err(PeerError::InvalidArgument {
                reason: format!("replication degree must be at least 1, got {}", desired_degree),
            });
        }
        let data = Bytes::from(tokio::fs::read(path).await?);
        let file_id = FileId::for_path(path)?;
        let chunks = split_chunks(&data);
        let chunk_count = chunks.len() as u32;

        let store = self.engine.store();
        if let Some(previous) = store.owned_file_by_path(path) {
            if previous.file_id != file_id {
                info!(path = %path.display(), old = %previous.file_id, "file changed since last backup");
                store.remove_own_file(&previous.file_id);
            }
        }
        store.register_own_file(OwnedFile {
            file_id: file_id.clone(),
            path: path.to_path_buf(),
            desired_degree,
            chunk_count,
        });
        info!(
            peer = %self.engine.peer_id(),
            path = %path.display(),
            file = %file_id,
            chunks = chunk_count,
            desired = desired_degree,
            "backup started"
        );

        let tasks = chunks
            .into_iter()
            .enumerate()
            .map(|(no, body)| {
                let chunk = ChunkId::new(file_id.clone(), no as u32);
                self.engine.spawn_chunk_backup(chunk, desired_degree, body)
            })
            .collect();
        Ok(BackupHandle {
            file_id,
            chunk_count,
            tasks,
        })
    }

    async fn restore(&self, path: &Path) -> Result<RestoreHandle> {
        let owned = self
            .engine
            .store()
            .owned_file_by_path(path)
            .ok_or_else(|| PeerError::FileNotOwned {
                path: path.to_path_buf(),
            })?;
        let file_name = path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(owned.file_id.as_str()));
        let destination = self.engine.config().restored_dir().join(file_name);

        info!(
            peer = %self.engine.peer_id(),
            file = %owned.file_id,
            chunks = owned.chunk_count,
            destination = %destination.display(),
            "restore started"
        );
        let session = self.engine.open_session(owned.file_id.clone(), destination);
        let tasks = (0..owned.chunk_count)
            .map(|no| {
                self.engine
                    .spawn_chunk_restore(ChunkId::new(owned.file_id.clone(), no))
            })
            .collect();
        Ok(RestoreHandle { session, tasks })
    }

    async fn delete(&self, path: &Path) -> Result<FileId> {
        let file_id = self.resolve_for_delete(path)?;
        let store = self.engine.store();
        store.remove_own_file(&file_id);
        if self.engine.version().delete_enhanced() {
            store.mark_for_deletion(&file_id);
        }
        store.delete_file(&file_id);
        info!(peer = %self.engine.peer_id(), path = %path.display(), file = %file_id, "delete started");

        let engine = self.engine.clone();
        let broadcast = file_id.clone();
        tokio::spawn(async move { engine.broadcast_delete(broadcast).await });
        Ok(file_id)
    }

    async fn reclaim(&self, max_bytes: u64) -> Result<Vec<ChunkId>> {
        let evicted = self.engine.store().reclaim(max_bytes);
        for chunk in &evicted {
            let message = Message::Removed {
                header: self.engine.header(),
                chunk: chunk.clone(),
            };
            self.engine.send_control(message).await;
        }
        info!(
            peer = %self.engine.peer_id(),
            max_bytes,
            evicted = evicted.len(),
            occupied = self.engine.store().occupied_bytes(),
            "reclaim done"
        );
        Ok(evicted)
    }

    fn state(&self) -> PeerState {
        PeerState::collect(&self.engine, &self.channels)
    }
}
