//! Per-peer chunk store and replication bookkeeping.
//!
//! `ChunkStore` is shared by the message dispatch tasks and by the initiator
//! and repair tasks. Its maps are sharded (`DashMap`) so updates for different
//! chunks never serialize on a global lock; only the snapshot write itself is
//! serialized. Every mutating operation writes a full snapshot before it
//! returns. A failed snapshot write is logged and the operation keeps its
//! in-memory effect.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::{ChunkId, FileId, PeerId, CHUNK_SIZE};
use crate::error::{StorageError, StorageResult};
use crate::eviction::{EvictionCandidate, EvictionPolicy};
use crate::snapshot::StoreSnapshot;

const CHUNKS_DIR: &str = "chunks";
const SNAPSHOT_FILENAME: &str = "state.bin";

/// Configuration for a peer's chunk store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the snapshot and the `chunks/` directory.
    pub root: PathBuf,
    /// This peer's id, used when evicting to drop our own holder entry.
    pub peer_id: PeerId,
    /// Space budget used when no snapshot exists yet.
    pub capacity_bytes: u64,
    /// Upper bound of the random delay taken before storing a new chunk.
    pub jitter_max: Duration,
    /// Reclaim victim selection.
    pub eviction: EvictionPolicy,
}

impl StoreConfig {
    /// Create a config rooted at `root` with default limits.
    pub fn new(root: impl Into<PathBuf>, peer_id: PeerId) -> Self {
        Self {
            root: root.into(),
            peer_id,
            capacity_bytes: 6_400_000,
            jitter_max: Duration::from_millis(400),
            eviction: EvictionPolicy::default(),
        }
    }
}

/// A file this peer originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedFile {
    /// Identifier derived at backup time.
    pub file_id: FileId,
    /// Path the file was backed up from.
    pub path: PathBuf,
    /// Desired replication degree.
    pub desired_degree: u32,
    /// Total chunk count, including an empty terminator chunk.
    pub chunk_count: u32,
}

/// Result of `ChunkStore::store_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The chunk was written now.
    Stored,
    /// The chunk was already held; nothing was written.
    AlreadyStored,
    /// The store declined: replication already satisfied or chunk pending deletion.
    Declined,
}

impl StoreOutcome {
    /// True when the chunk is held locally after the call.
    pub fn is_held(&self) -> bool {
        !matches!(self, StoreOutcome::Declined)
    }
}

/// A chunk held on disk, as reported by `ChunkStore::stored_chunks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredChunkInfo {
    /// The chunk.
    pub chunk: ChunkId,
    /// Bytes on disk.
    pub size_bytes: u64,
    /// Perceived replication degree.
    pub perceived_degree: Option<usize>,
    /// Desired replication degree of its file.
    pub desired_degree: Option<u32>,
}

/// Durable bookkeeping for one peer.
pub struct ChunkStore {
    config: StoreConfig,
    capacity: AtomicU64,
    occupied: AtomicU64,
    stored: DashMap<ChunkId, u64>,
    desired: DashMap<FileId, u32>,
    holders: DashMap<ChunkId, BTreeSet<PeerId>>,
    owned: DashMap<FileId, OwnedFile>,
    marked: DashMap<ChunkId, BTreeSet<PeerId>>,
    persist_lock: Mutex<()>,
}

impl ChunkStore {
    /// Open the store, creating its directories and reloading the last snapshot.
    ///
    /// Stored-chunk entries whose file is missing on disk are dropped.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        fs::create_dir_all(config.root.join(CHUNKS_DIR))?;
        let snapshot_path = config.root.join(SNAPSHOT_FILENAME);
        let snapshot = StoreSnapshot::read_from(&snapshot_path)?;

        let store = Self {
            capacity: AtomicU64::new(config.capacity_bytes),
            occupied: AtomicU64::new(0),
            stored: DashMap::new(),
            desired: DashMap::new(),
            holders: DashMap::new(),
            owned: DashMap::new(),
            marked: DashMap::new(),
            persist_lock: Mutex::new(()),
            config,
        };

        if let Some(snapshot) = snapshot {
            store.restore_snapshot(snapshot);
            info!(
                root = %store.config.root.display(),
                chunks = store.stored.len(),
                owned = store.owned.len(),
                "loaded chunk store snapshot"
            );
        }
        Ok(store)
    }

    fn restore_snapshot(&self, snapshot: StoreSnapshot) {
        self.capacity.store(snapshot.capacity_bytes, Ordering::SeqCst);
        let mut occupied = 0;
        for (chunk, size) in snapshot.stored {
            if self.chunk_path(&chunk).exists() {
                occupied += size;
                self.stored.insert(chunk, size);
            } else {
                warn!(chunk = %chunk, "stored chunk missing on disk, dropping entry");
            }
        }
        self.occupied.store(occupied, Ordering::SeqCst);
        for (file, degree) in snapshot.desired {
            self.desired.insert(file, degree);
        }
        for (chunk, holders) in snapshot.holders {
            self.holders.insert(chunk, holders);
        }
        for (file, owned) in snapshot.owned {
            self.owned.insert(file, owned);
        }
        for (chunk, holders) in snapshot.marked_for_deletion {
            self.marked.insert(chunk, holders);
        }
    }

    /// Directory holding the snapshot and chunk files.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// This peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.config.peer_id
    }

    fn chunk_path(&self, chunk: &ChunkId) -> PathBuf {
        self.config.root.join(CHUNKS_DIR).join(chunk.file_name())
    }

    // ---------------------------------------------------------------------
    // Stored chunks
    // ---------------------------------------------------------------------

    /// True if this peer holds the chunk's bytes.
    pub fn has_chunk(&self, chunk: &ChunkId) -> bool {
        self.stored.contains_key(chunk)
    }

    /// Store a chunk received in a PUTCHUNK.
    ///
    /// Returns `AlreadyStored` immediately if the chunk is held. Otherwise
    /// waits a random jitter, optionally declines when the perceived degree
    /// already meets `desired_degree`, and writes the bytes.
    pub async fn store_chunk(
        &self,
        chunk: &ChunkId,
        desired_degree: u32,
        data: &[u8],
        skip_if_satisfied: bool,
    ) -> StorageResult<StoreOutcome> {
        if self.has_chunk(chunk) {
            return Ok(StoreOutcome::AlreadyStored);
        }
        if self.marked.contains_key(chunk) {
            return Ok(StoreOutcome::Declined);
        }

        tokio::time::sleep(jitter_delay(self.config.jitter_max)).await;

        if skip_if_satisfied {
            if let Some(perceived) = self.perceived_degree(chunk) {
                if perceived >= desired_degree as usize {
                    debug!(chunk = %chunk, perceived, desired_degree, "replication satisfied, not storing");
                    return Ok(StoreOutcome::Declined);
                }
            }
        }

        let size = data.len() as u64;
        match self.stored.entry(chunk.clone()) {
            Entry::Occupied(_) => return Ok(StoreOutcome::AlreadyStored),
            Entry::Vacant(slot) => {
                fs::write(self.chunk_path(chunk), data)?;
                slot.insert(size);
            }
        }
        self.occupied.fetch_add(size, Ordering::SeqCst);
        self.desired
            .entry(chunk.file_id.clone())
            .or_insert(desired_degree);
        self.persist();
        Ok(StoreOutcome::Stored)
    }

    /// Read a held chunk's bytes.
    pub fn read_chunk(&self, chunk: &ChunkId) -> StorageResult<Bytes> {
        if !self.has_chunk(chunk) {
            return Err(StorageError::ChunkNotFound {
                chunk: chunk.clone(),
            });
        }
        let mut data = match fs::read(self.chunk_path(chunk)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ChunkNotFound {
                    chunk: chunk.clone(),
                })
            }
            Err(e) => return Err(StorageError::IoError(e)),
        };
        data.truncate(CHUNK_SIZE);
        Ok(Bytes::from(data))
    }

    /// Snapshot of all held chunks, ordered by chunk id.
    pub fn stored_chunks(&self) -> Vec<StoredChunkInfo> {
        let held: Vec<(ChunkId, u64)> = self
            .stored
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let mut chunks: Vec<StoredChunkInfo> = held
            .into_iter()
            .map(|(chunk, size_bytes)| StoredChunkInfo {
                perceived_degree: self.perceived_degree(&chunk),
                desired_degree: self.desired_degree(&chunk.file_id),
                chunk,
                size_bytes,
            })
            .collect();
        chunks.sort_by(|a, b| a.chunk.cmp(&b.chunk));
        chunks
    }

    // ---------------------------------------------------------------------
    // Replication records
    // ---------------------------------------------------------------------

    /// Record that `peer` acknowledged storing `chunk`. Returns true if the holder set grew.
    ///
    /// A chunk pending deletion keeps its marked set instead: the sender is
    /// added there so it receives the DELETE handshake.
    pub fn record_stored(&self, chunk: &ChunkId, peer: PeerId) -> bool {
        if let Some(mut pending) = self.marked.get_mut(chunk) {
            let added = pending.insert(peer);
            drop(pending);
            if added {
                self.persist();
            }
            return false;
        }

        let added = self.holders.entry(chunk.clone()).or_default().insert(peer);
        if added {
            self.persist();
        }
        added
    }

    /// Record that `peer` dropped its copy of `chunk`. Returns false if no record exists.
    pub fn record_removed(&self, chunk: &ChunkId, peer: PeerId) -> bool {
        let changed = {
            let Some(mut holders) = self.holders.get_mut(chunk) else {
                return false;
            };
            holders.remove(&peer)
        };
        if changed {
            self.persist();
        }
        true
    }

    /// Number of peers believed to hold `chunk`, `None` if there is no record.
    pub fn perceived_degree(&self, chunk: &ChunkId) -> Option<usize> {
        self.holders.get(chunk).map(|holders| holders.len())
    }

    /// Believed holders of `chunk`.
    pub fn holders(&self, chunk: &ChunkId) -> Vec<PeerId> {
        self.holders
            .get(chunk)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Desired replication degree for `file`, `None` if unknown.
    pub fn desired_degree(&self, file: &FileId) -> Option<u32> {
        self.desired.get(file).map(|degree| *degree)
    }

    // ---------------------------------------------------------------------
    // Owned files
    // ---------------------------------------------------------------------

    /// Register (or replace) a file this peer originated.
    pub fn register_own_file(&self, file: OwnedFile) {
        self.desired
            .insert(file.file_id.clone(), file.desired_degree);
        self.owned.insert(file.file_id.clone(), file);
        self.persist();
    }

    /// True if `file` was originated by this peer.
    pub fn is_own_file(&self, file: &FileId) -> bool {
        self.owned.contains_key(file)
    }

    /// Look up an owned file by id.
    pub fn owned_file(&self, file: &FileId) -> Option<OwnedFile> {
        self.owned.get(file).map(|entry| entry.clone())
    }

    /// Look up an owned file by the path it was backed up from.
    pub fn owned_file_by_path(&self, path: &Path) -> Option<OwnedFile> {
        self.owned
            .iter()
            .find(|entry| entry.path == path)
            .map(|entry| entry.clone())
    }

    /// All owned files, ordered by path.
    pub fn owned_files(&self) -> Vec<OwnedFile> {
        let mut files: Vec<OwnedFile> = self.owned.iter().map(|entry| entry.clone()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Forget an owned file.
    pub fn remove_own_file(&self, file: &FileId) -> Option<OwnedFile> {
        let removed = self.owned.remove(file).map(|(_, owned)| owned);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    // ---------------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------------

    /// Move every replication record of `file` into the marked-for-deletion
    /// map. Records with no holders are dropped. Returns the number of chunks marked.
    pub fn mark_for_deletion(&self, file: &FileId) -> usize {
        let chunks: Vec<ChunkId> = self
            .holders
            .iter()
            .filter(|entry| entry.key().file_id == *file)
            .map(|entry| entry.key().clone())
            .collect();

        let mut marked = 0;
        for chunk in chunks {
            let Some((chunk, holders)) = self.holders.remove(&chunk) else {
                continue;
            };
            if holders.is_empty() {
                continue;
            }
            self.marked.entry(chunk).or_default().extend(holders);
            marked += 1;
        }
        self.persist();
        marked
    }

    /// True if any chunk of `file` is waiting for DELETED acknowledgments.
    pub fn is_marked_for_deletion(&self, file: &FileId) -> bool {
        self.marked.iter().any(|entry| entry.key().file_id == *file)
    }

    /// Peers still expected to acknowledge deletion of `chunk`.
    pub fn pending_deletion(&self, chunk: &ChunkId) -> Option<Vec<PeerId>> {
        self.marked
            .get(chunk)
            .map(|holders| holders.iter().copied().collect())
    }

    /// Number of chunks still waiting for DELETED acknowledgments.
    pub fn pending_deletion_count(&self) -> usize {
        self.marked.len()
    }

    /// Record a DELETED acknowledgment. Returns true if the chunk's entry was dropped.
    pub fn record_deleted(&self, chunk: &ChunkId, peer: PeerId) -> bool {
        let drained = {
            let Some(mut holders) = self.marked.get_mut(chunk) else {
                return false;
            };
            holders.remove(&peer);
            holders.is_empty()
        };
        if drained {
            self.marked.remove(chunk);
        }
        self.persist();
        drained
    }

    /// Files with a chunk `peer` is still believed to hold after deletion.
    pub fn files_pending_deletion_for(&self, peer: PeerId) -> Vec<FileId> {
        let files: BTreeSet<FileId> = self
            .marked
            .iter()
            .filter(|entry| entry.value().contains(&peer))
            .map(|entry| entry.key().file_id.clone())
            .collect();
        files.into_iter().collect()
    }

    /// Delete every held chunk of `file` and its bookkeeping. Returns the removed chunk numbers.
    pub fn delete_file(&self, file: &FileId) -> BTreeSet<u32> {
        let chunks: Vec<ChunkId> = self
            .stored
            .iter()
            .filter(|entry| entry.key().file_id == *file)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = BTreeSet::new();
        for chunk in chunks {
            if self.remove_chunk_bytes(&chunk) {
                removed.insert(chunk.chunk_no);
            }
        }
        self.holders.retain(|chunk, _| chunk.file_id != *file);
        self.desired.remove(file);
        self.persist();

        if !removed.is_empty() {
            info!(file = %file, chunks = removed.len(), "deleted stored chunks");
        }
        removed
    }

    fn remove_chunk_bytes(&self, chunk: &ChunkId) -> bool {
        let Some((_, size)) = self.stored.remove(chunk) else {
            return false;
        };
        self.occupied.fetch_sub(size, Ordering::SeqCst);
        if let Err(e) = fs::remove_file(self.chunk_path(chunk)) {
            if e.kind() != ErrorKind::NotFound {
                warn!(chunk = %chunk, error = %e, "failed to remove chunk file");
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Space
    // ---------------------------------------------------------------------

    /// Current space budget in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Bytes occupied by held chunks.
    pub fn occupied_bytes(&self) -> u64 {
        self.occupied.load(Ordering::SeqCst)
    }

    /// True if a chunk of `len` bytes fits in the budget.
    pub fn has_room_for(&self, len: usize) -> bool {
        self.occupied_bytes() + len as u64 <= self.capacity_bytes()
    }

    /// Lower (or raise) the budget to `max_bytes` and evict until it fits.
    ///
    /// Returns the evicted chunks in eviction order. For each evicted chunk
    /// this peer is removed from the chunk's holder set.
    pub fn reclaim(&self, max_bytes: u64) -> Vec<ChunkId> {
        self.capacity.store(max_bytes, Ordering::SeqCst);
        let mut evicted = Vec::new();

        while self.occupied_bytes() > max_bytes {
            let candidates = self.eviction_candidates();
            let Some(victim) = self.config.eviction.select(&candidates) else {
                break;
            };
            let chunk = victim.chunk.clone();
            if !self.remove_chunk_bytes(&chunk) {
                break;
            }
            if let Some(mut holders) = self.holders.get_mut(&chunk) {
                holders.remove(&self.config.peer_id);
            }
            debug!(chunk = %chunk, "evicted chunk");
            evicted.push(chunk);
        }

        self.persist();
        evicted
    }

    fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        let stored: Vec<(ChunkId, u64)> = self
            .stored
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        stored
            .into_iter()
            .map(|(chunk, size_bytes)| EvictionCandidate {
                perceived_degree: self.perceived_degree(&chunk),
                chunk,
                size_bytes,
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Build a snapshot of the current state.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            capacity_bytes: self.capacity_bytes(),
            stored: collect_map(&self.stored),
            desired: collect_map(&self.desired),
            holders: collect_map(&self.holders),
            owned: collect_map(&self.owned),
            marked_for_deletion: collect_map(&self.marked),
        }
    }

    fn persist(&self) {
        let _guard = match self.persist_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = self.config.root.join(SNAPSHOT_FILENAME);
        if let Err(e) = self.snapshot().write_to(&path) {
            warn!(path = %path.display(), error = %e, "failed to persist store snapshot");
        }
    }
}

fn collect_map<K, V>(map: &DashMap<K, V>) -> BTreeMap<K, V>
where
    K: Clone + Ord + std::hash::Hash + Eq,
    V: Clone,
{
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect()
}

/// A uniformly random delay in `0..=max`.
pub fn jitter_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
