//! Identifiers and file chunking.
//!
//! A file is cut into `CHUNK_SIZE` slices. The last slice is always shorter
//! than `CHUNK_SIZE`; when the file length is an exact multiple, an explicit
//! zero-length chunk terminates the sequence so the chunk count can be
//! recovered from the chunks alone.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum chunk payload in bytes.
pub const CHUNK_SIZE: usize = 64_000;

/// Length of a hex-encoded SHA-256 file identifier.
const FILE_ID_LEN: usize = 64;

/// Identifier of a peer process. The id space is small (configured per peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PeerId)
    }
}

/// Content-derived file identifier: hex SHA-256 over `path + dd/mm/yyyy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    /// Derive the identifier from a path string and a `dd/mm/yyyy` creation date.
    pub fn derive(path: &str, created: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(created.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Derive the identifier for a file on disk.
    ///
    /// Uses the creation time when the platform reports one and falls back to
    /// the modification time otherwise.
    pub fn for_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        Ok(Self::derive(&path.to_string_lossy(), &format_date(created)))
    }

    /// Parse a wire token. Accepts exactly 64 hex digits, normalized to lowercase.
    pub fn parse(token: &str) -> Option<Self> {
        if token.len() == FILE_ID_LEN && token.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(token.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// The hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chunk of a file: `(file_id, chunk_no)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    /// File the chunk belongs to.
    pub file_id: FileId,
    /// Zero-based position within the file.
    pub chunk_no: u32,
}

impl ChunkId {
    /// Create a chunk identifier.
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        Self { file_id, chunk_no }
    }

    /// On-disk file name, `<fileId>_<chunkNo>`.
    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.file_id, self.chunk_no)
    }
}

/// Number of chunks a file of `len` bytes is cut into.
pub fn chunk_count(len: u64) -> u32 {
    (len / CHUNK_SIZE as u64) as u32 + 1
}

/// A chunk shorter than `CHUNK_SIZE` is the last one of its file.
pub fn is_terminal_chunk(len: usize) -> bool {
    len < CHUNK_SIZE
}

/// Split file contents into chunks without copying.
pub fn split_chunks(data: &Bytes) -> Vec<Bytes> {
    let count = chunk_count(data.len() as u64) as usize;
    (0..count)
        .map(|i| {
            let start = (i * CHUNK_SIZE).min(data.len());
            let end = (start + CHUNK_SIZE).min(data.len());
            data.slice(start..end)
        })
        .collect()
}

fn format_date(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%d/%m/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_is_hex_sha256() {
        let id = FileId::derive("/home/user/report.pdf", "03/04/2019");
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_file_id_depends_on_path_and_date() {
        let a = FileId::derive("a.txt", "01/01/2020");
        let b = FileId::derive("a.txt", "02/01/2020");
        let c = FileId::derive("b.txt", "01/01/2020");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, FileId::derive("a.txt", "01/01/2020"));
    }

    #[test]
    fn test_file_id_parse() {
        let id = FileId::derive("x", "01/01/2020");
        assert_eq!(FileId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(FileId::parse(&id.as_str().to_ascii_uppercase()), Some(id));
        assert_eq!(FileId::parse("abc"), None);
        assert_eq!(FileId::parse(&"g".repeat(64)), None);
    }

    #[test]
    fn test_for_path_matches_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello").unwrap();
        let first = FileId::for_path(&path).unwrap();
        let second = FileId::for_path(&path).unwrap();
        assert_eq!(first, second);
        assert!(FileId::for_path(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_chunk_file_name() {
        let id = FileId::derive("x", "01/01/2020");
        let chunk = ChunkId::new(id.clone(), 7);
        assert_eq!(chunk.file_name(), format!("{}_7", id));
    }

    #[test]
    fn test_peer_id_parse() {
        assert_eq!("12".parse::<PeerId>().unwrap(), PeerId(12));
        assert!("x".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_split_with_remainder() {
        let data = Bytes::from(vec![1u8; 3 * CHUNK_SIZE + 17]);
        let chunks = split_chunks(&data);
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3].iter().all(|c| c.len() == CHUNK_SIZE));
        assert_eq!(chunks[3].len(), 17);
    }

    #[test]
    fn test_split_exact_multiple_adds_empty_terminator() {
        let data = Bytes::from(vec![9u8; 2 * CHUNK_SIZE]);
        let chunks = split_chunks(&data);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_empty());
        assert!(is_terminal_chunk(chunks[2].len()));
        assert!(!is_terminal_chunk(chunks[1].len()));
    }

    #[test]
    fn test_split_empty_file() {
        let chunks = split_chunks(&Bytes::new());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        assert_eq!(chunk_count(0), 1);
    }
}
