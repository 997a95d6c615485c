#![warn(missing_docs)]

//! chunkmesh storage subsystem: chunk store, replication bookkeeping, snapshot persistence
//!
//! This crate holds everything a peer keeps on local disk: the bytes of the
//! chunks it agreed to store, the replication records it derives from
//! STORED/REMOVED acknowledgments, the registry of files it originated and the
//! deletion handshake state. Every mutation is followed by a full snapshot.

pub mod chunk;
pub mod error;
pub mod eviction;
pub mod snapshot;
pub mod store;

pub use chunk::{split_chunks, chunk_count, is_terminal_chunk, ChunkId, FileId, PeerId, CHUNK_SIZE};
pub use error::{StorageError, StorageResult};
pub use eviction::{EvictionCandidate, EvictionPolicy};
pub use snapshot::StoreSnapshot;
pub use store::{jitter_delay, ChunkStore, OwnedFile, StoreConfig, StoreOutcome, StoredChunkInfo};
