//! Error types for the transport subsystem.

use thiserror::Error;

/// Error variants for channel setup and direct delivery.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Wraps standard I/O errors.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// A group address could not be parsed.
    #[error("invalid group address {addr}: {reason}")]
    InvalidGroupAddress {
        /// The address as given.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The address parsed but is not an IPv4 multicast group.
    #[error("{addr} is not an IPv4 multicast address")]
    NotMulticast {
        /// The offending address.
        addr: String,
    },
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
