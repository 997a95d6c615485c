//! Wire format shared by every message kind.
//!
//! A message is an ASCII header of space-separated fields terminated by a
//! blank line, optionally followed by a binary body:
//!
//! ```text
//! PUTCHUNK <version> <senderId> <fileId> <chunkNo> <desiredDegree>\r\n\r\n<bytes>
//! ```
//!
//! Encoding always emits `\r\n\r\n`; decoding also accepts `\n\n`. Decoding
//! never fails: invalid input becomes `Message::Malformed` so the receive
//! path can log and drop it.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use chunkmesh_storage::{ChunkId, FileId, PeerId, CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CRLF_TERMINATOR: &[u8] = b"\r\n\r\n";
const LF_TERMINATOR: &[u8] = b"\n\n";

/// Fields every header carries before the type-specific ones.
const COMMON_FIELDS: usize = 3;

/// Protocol version `<major>.<minor>`; selects optional protocol enhancements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

/// A version string that is not `<major>.<minor>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid protocol version: {0:?}")]
pub struct InvalidVersion(pub String);

impl ProtocolVersion {
    /// The vanilla protocol.
    pub const V1_0: Self = Self::new(1, 0);

    /// Create a version.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    fn enables(&self, minor: u8) -> bool {
        self.major >= 2 || (self.major == 1 && self.minor == minor)
    }

    /// Peers check perceived replication before storing; initiators run the backup watchdog.
    pub fn backup_enhanced(&self) -> bool {
        self.enables(1)
    }

    /// CHUNK replies travel over a direct TCP connection to the requester.
    pub fn restore_enhanced(&self) -> bool {
        self.enables(2)
    }

    /// DELETED acknowledgments and the AHOY greeting.
    pub fn delete_enhanced(&self) -> bool {
        self.enables(3)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').ok_or_else(|| InvalidVersion(s.to_string()))?;
        match (major.parse(), minor.parse()) {
            (Ok(major), Ok(minor)) => Ok(Self::new(major, minor)),
            _ => Err(InvalidVersion(s.to_string())),
        }
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

/// Message type token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Ask peers to store a chunk.
    PutChunk,
    /// A peer stored a chunk.
    Stored,
    /// Ask for a chunk's bytes.
    GetChunk,
    /// A chunk's bytes.
    Chunk,
    /// Delete every chunk of a file.
    Delete,
    /// A peer deleted a chunk.
    Deleted,
    /// A peer evicted a chunk.
    Removed,
    /// Peer greeting.
    Ahoy,
}

impl MessageKind {
    /// Wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PutChunk => "PUTCHUNK",
            MessageKind::Stored => "STORED",
            MessageKind::GetChunk => "GETCHUNK",
            MessageKind::Chunk => "CHUNK",
            MessageKind::Delete => "DELETE",
            MessageKind::Deleted => "DELETED",
            MessageKind::Removed => "REMOVED",
            MessageKind::Ahoy => "AHOY",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "PUTCHUNK" => MessageKind::PutChunk,
            "STORED" => MessageKind::Stored,
            "GETCHUNK" => MessageKind::GetChunk,
            "CHUNK" => MessageKind::Chunk,
            "DELETE" => MessageKind::Delete,
            "DELETED" => MessageKind::Deleted,
            "REMOVED" => MessageKind::Removed,
            "AHOY" => MessageKind::Ahoy,
            _ => return None,
        })
    }

    /// Number of type-specific header fields.
    fn arity(&self) -> usize {
        match self {
            MessageKind::PutChunk => 3,
            MessageKind::Delete => 1,
            MessageKind::Ahoy => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every well-formed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's protocol version.
    pub version: ProtocolVersion,
    /// Sender's peer id.
    pub sender: PeerId,
}

impl Header {
    /// Create a header.
    pub fn new(version: ProtocolVersion, sender: PeerId) -> Self {
        Self { version, sender }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `PUTCHUNK`: store this chunk.
    PutChunk {
        /// Common header.
        header: Header,
        /// Chunk being backed up.
        chunk: ChunkId,
        /// Desired replication degree of the file.
        desired_degree: u32,
        /// Chunk bytes.
        body: Bytes,
    },
    /// `STORED`: the sender holds the chunk.
    Stored {
        /// Common header.
        header: Header,
        /// Chunk stored.
        chunk: ChunkId,
    },
    /// `GETCHUNK`: send me this chunk.
    GetChunk {
        /// Common header.
        header: Header,
        /// Chunk requested.
        chunk: ChunkId,
    },
    /// `CHUNK`: the chunk's bytes.
    Chunk {
        /// Common header.
        header: Header,
        /// Chunk carried.
        chunk: ChunkId,
        /// Chunk bytes.
        body: Bytes,
    },
    /// `DELETE`: drop every chunk of the file.
    Delete {
        /// Common header.
        header: Header,
        /// File to delete.
        file_id: FileId,
    },
    /// `DELETED`: the sender dropped the chunk.
    Deleted {
        /// Common header.
        header: Header,
        /// Chunk deleted.
        chunk: ChunkId,
    },
    /// `REMOVED`: the sender evicted the chunk.
    Removed {
        /// Common header.
        header: Header,
        /// Chunk evicted.
        chunk: ChunkId,
    },
    /// `AHOY`: the sender came online.
    Ahoy {
        /// Common header.
        header: Header,
    },
    /// A well-formed header with a type token nobody understands.
    Unknown {
        /// Common header.
        header: Header,
        /// The type token as received.
        kind: String,
    },
    /// Input that could not be decoded.
    Malformed {
        /// What was wrong with it.
        reason: String,
    },
}

fn malformed(reason: impl Into<String>) -> Message {
    Message::Malformed {
        reason: reason.into(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a datagram into header text and body at the first blank line.
fn split_header(datagram: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(datagram, CRLF_TERMINATOR).map(|at| (at, CRLF_TERMINATOR.len()));
    let lf = find(datagram, LF_TERMINATOR).map(|at| (at, LF_TERMINATOR.len()));
    let (at, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&datagram[..at], &datagram[at + len..]))
}

impl Message {
    /// The common header, `None` for `Malformed`.
    pub fn header(&self) -> Option<&Header> {
        match self {
            Message::PutChunk { header, .. }
            | Message::Stored { header, .. }
            | Message::GetChunk { header, .. }
            | Message::Chunk { header, .. }
            | Message::Delete { header, .. }
            | Message::Deleted { header, .. }
            | Message::Removed { header, .. }
            | Message::Ahoy { header }
            | Message::Unknown { header, .. } => Some(header),
            Message::Malformed { .. } => None,
        }
    }

    /// Known message kind, `None` for `Unknown` and `Malformed`.
    pub fn kind(&self) -> Option<MessageKind> {
        Some(match self {
            Message::PutChunk { .. } => MessageKind::PutChunk,
            Message::Stored { .. } => MessageKind::Stored,
            Message::GetChunk { .. } => MessageKind::GetChunk,
            Message::Chunk { .. } => MessageKind::Chunk,
            Message::Delete { .. } => MessageKind::Delete,
            Message::Deleted { .. } => MessageKind::Deleted,
            Message::Removed { .. } => MessageKind::Removed,
            Message::Ahoy { .. } => MessageKind::Ahoy,
            Message::Unknown { .. } | Message::Malformed { .. } => return None,
        })
    }

    /// Encode to wire bytes. `Malformed` encodes to nothing.
    pub fn encode(&self) -> Bytes {
        let Some(header) = self.header() else {
            return Bytes::new();
        };
        let kind = match self {
            Message::Unknown { kind, .. } => kind.as_str(),
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        };

        let mut line = format!("{} {} {}", kind, header.version, header.sender);
        let body = match self {
            Message::PutChunk {
                chunk,
                desired_degree,
                body,
                ..
            } => {
                line.push_str(&format!(" {} {} {}", chunk.file_id, chunk.chunk_no, desired_degree));
                Some(body)
            }
            Message::Chunk { chunk, body, .. } => {
                line.push_str(&format!(" {} {}", chunk.file_id, chunk.chunk_no));
                Some(body)
            }
            Message::Stored { chunk, .. }
            | Message::GetChunk { chunk, .. }
            | Message::Deleted { chunk, .. }
            | Message::Removed { chunk, .. } => {
                line.push_str(&format!(" {} {}", chunk.file_id, chunk.chunk_no));
                None
            }
            Message::Delete { file_id, .. } => {
                line.push_str(&format!(" {}", file_id));
                None
            }
            Message::Ahoy { .. } | Message::Unknown { .. } | Message::Malformed { .. } => None,
        };

        let body_len = body.map(|b| b.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(line.len() + CRLF_TERMINATOR.len() + body_len);
        buf.put_slice(line.as_bytes());
        buf.put_slice(CRLF_TERMINATOR);
        if let Some(body) = body {
            buf.put_slice(body);
        }
        buf.freeze()
    }

    /// Decode a datagram. Never fails; invalid input yields `Malformed`.
    pub fn decode(datagram: &[u8]) -> Message {
        let Some((head, body)) = split_header(datagram) else {
            return malformed("missing header terminator");
        };
        let Ok(head) = std::str::from_utf8(head) else {
            return malformed("header is not ASCII");
        };
        let fields: Vec<&str> = head.split_ascii_whitespace().collect();
        if fields.len() < COMMON_FIELDS {
            return malformed(format!("header has {} fields, need at least {}", fields.len(), COMMON_FIELDS));
        }

        let Ok(version) = fields[1].parse::<ProtocolVersion>() else {
            return malformed(format!("bad version {:?}", fields[1]));
        };
        let Ok(sender) = fields[2].parse::<PeerId>() else {
            return malformed(format!("bad sender id {:?}", fields[2]));
        };
        let header = Header::new(version, sender);

        let Some(kind) = MessageKind::from_token(fields[0]) else {
            return Message::Unknown {
                header,
                kind: fields[0].to_string(),
            };
        };
        let args = &fields[COMMON_FIELDS..];
        if args.len() < kind.arity() {
            return malformed(format!("{} needs {} fields, got {}", kind, kind.arity(), args.len()));
        }
        if body.len() > CHUNK_SIZE {
            return malformed(format!("body of {} bytes exceeds chunk size", body.len()));
        }

        if kind == MessageKind::Ahoy {
            return Message::Ahoy { header };
        }
        let Some(file_id) = FileId::parse(args[0]) else {
            return malformed(format!("bad file id {:?}", args[0]));
        };
        if kind == MessageKind::Delete {
            return Message::Delete { header, file_id };
        }
        let Ok(chunk_no) = args[1].parse::<u32>() else {
            return malformed(format!("bad chunk number {:?}", args[1]));
        };
        let chunk = ChunkId::new(file_id, chunk_no);

        match kind {
            MessageKind::PutChunk => match args[2].parse::<u32>() {
                Ok(desired_degree) => Message::PutChunk {
                    header,
                    chunk,
                    desired_degree,
                    body: Bytes::copy_from_slice(body),
                },
                Err(_) => malformed(format!("bad replication degree {:?}", args[2])),
            },
            MessageKind::Stored => Message::Stored { header, chunk },
            MessageKind::GetChunk => Message::GetChunk { header, chunk },
            MessageKind::Chunk => Message::Chunk {
                header,
                chunk,
                body: Bytes::copy_from_slice(body),
            },
            MessageKind::Deleted => Message::Deleted { header, chunk },
            MessageKind::Removed => Message::Removed { header, chunk },
            MessageKind::Delete | MessageKind::Ahoy => unreachable!("handled above"),
        }
    }
}
