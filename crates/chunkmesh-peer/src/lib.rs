#![warn(missing_docs)]

//! chunkmesh peer subsystem: replication engine, restore sessions, local control surface
//!
//! A peer stores chunks for others and backs up its own files through them.
//! All coordination happens over three multicast groups; the engine reacts to
//! each datagram independently and the initiator side drives bounded retry
//! loops until enough acknowledgments are observed.

pub mod cli;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
mod initiator;
pub mod node;
pub mod restorer;
pub mod state;

pub use cli::{Cli, ConsoleCommand};
pub use config::PeerConfig;
pub use control::{BackupHandle, LocalControl, LocalControlSurface, RestoreHandle};
pub use engine::{Channels, ReplicationEngine};
pub use error::{PeerError, Result};
pub use node::Peer;
pub use restorer::{FeedOutcome, FileRestorer};
pub use state::{ChannelReport, ChunkReplication, OwnedFileState, PeerState};
