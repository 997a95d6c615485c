#![warn(missing_docs)]

//! chunkmesh transport subsystem: multicast group channels, header+body wire codec, direct TCP delivery

pub mod channel;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod tcp;

pub use channel::{
    ChannelKind, ChannelStats, ChannelStatsSnapshot, DatagramHandler, DirectSend, GroupChannel,
    GroupChannelConfig, GroupSend,
};
pub use error::{Result, TransportError};
pub use pool::WorkerPool;
pub use protocol::{Header, Message, MessageKind, ProtocolVersion};
pub use chunkmesh_storage::jitter_delay;
pub use retry::{BackoffSchedule, RetryOutcome};
pub use tcp::{DirectListener, TcpDirectSender};
