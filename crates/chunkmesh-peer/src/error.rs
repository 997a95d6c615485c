//! Error types for the peer subsystem.

use std::path::PathBuf;

use chunkmesh_storage::StorageError;
use chunkmesh_transport::TransportError;
use thiserror::Error;

/// Error variants surfaced by local operations and peer start-up.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Chunk store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel or socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why it was rejected.
        reason: String,
    },

    /// The path was never backed up by this peer.
    #[error("file not backed up by this peer: {}", path.display())]
    FileNotOwned {
        /// Path as given.
        path: PathBuf,
    },

    /// The configuration could not be loaded.
    #[error("configuration error: {reason}")]
    Config {
        /// What went wrong.
        reason: String,
    },
}

/// Result type alias for peer operations.
pub type Result<T> = std::result::Result<T, PeerError>;
