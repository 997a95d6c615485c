//! Error types for the storage subsystem.

use thiserror::Error;

use crate::chunk::ChunkId;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Snapshot encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The persisted snapshot exists but cannot be decoded.
    #[error("corrupt state snapshot at {path}: {reason}")]
    CorruptSnapshot {
        /// Path of the snapshot file.
        path: String,
        /// Decoder message.
        reason: String,
    },

    /// The requested chunk is not held by this peer.
    #[error("chunk not found: {chunk}")]
    ChunkNotFound {
        /// The chunk that was requested.
        chunk: ChunkId,
    },
}
