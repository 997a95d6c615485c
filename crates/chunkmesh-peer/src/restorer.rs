//! Reassembly of a file from CHUNK replies.
//!
//! A session collects chunks in any order. The first chunk shorter than
//! `CHUNK_SIZE` fixes the expected count; the session completes exactly once,
//! when every chunk below that count is present, by writing the concatenation
//! to its destination.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use chunkmesh_storage::{is_terminal_chunk, FileId};
use tracing::{debug, info, warn};

use crate::error::Result;

/// What a call to `FileRestorer::feed` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Duplicate, beyond the terminal chunk, or the session already completed.
    Ignored,
    /// Chunk kept; more are needed.
    Collected,
    /// The file was written to this path.
    Completed(PathBuf),
}

#[derive(Debug, Default)]
struct RestoreState {
    chunks: BTreeMap<u32, Bytes>,
    expected: Option<u32>,
    complete: bool,
}

/// One file being restored.
#[derive(Debug)]
pub struct FileRestorer {
    file_id: FileId,
    destination: PathBuf,
    started: Instant,
    state: Mutex<RestoreState>,
}

impl FileRestorer {
    /// Start a session writing to `destination` once complete.
    pub fn new(file_id: FileId, destination: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            destination: destination.into(),
            started: Instant::now(),
            state: Mutex::new(RestoreState::default()),
        }
    }

    /// File being restored.
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Where the file is written.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// When the session started.
    pub fn started(&self) -> Instant {
        self.started
    }

    fn state(&self) -> MutexGuard<'_, RestoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// True if `chunk_no` was already collected.
    pub fn has(&self, chunk_no: u32) -> bool {
        self.state().chunks.contains_key(&chunk_no)
    }

    /// Number of chunks collected so far.
    pub fn collected(&self) -> usize {
        self.state().chunks.len()
    }

    /// Total chunk count, once the terminal chunk has arrived.
    pub fn expected_count(&self) -> Option<u32> {
        self.state().expected
    }

    /// True once the file has been written.
    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Add one chunk. Completes the session when it was the last missing one.
    pub fn feed(&self, chunk_no: u32, body: Bytes) -> Result<FeedOutcome> {
        let mut state = self.state();
        if state.complete || state.chunks.contains_key(&chunk_no) {
            return Ok(FeedOutcome::Ignored);
        }
        if state.expected.is_some_and(|expected| chunk_no >= expected) {
            return Ok(FeedOutcome::Ignored);
        }

        if is_terminal_chunk(body.len()) {
            let Some(expected) = chunk_no.checked_add(1) else {
                warn!(file = %self.file_id, chunk_no, "terminal chunk number out of range");
                return Ok(FeedOutcome::Ignored);
            };
            state.expected = Some(expected);
            state.chunks.retain(|no, _| *no < expected);
            debug!(file = %self.file_id, expected, "terminal chunk received");
        }
        state.chunks.insert(chunk_no, body);

        match state.expected {
            Some(expected) if state.chunks.len() == expected as usize => {
                state.complete = true;
                let contents: Vec<u8> = state
                    .chunks
                    .values()
                    .flat_map(|chunk| chunk.iter().copied())
                    .collect();
                drop(state);

                if let Some(parent) = self.destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.destination, &contents)?;
                info!(
                    file = %self.file_id,
                    path = %self.destination.display(),
                    bytes = contents.len(),
                    chunks = expected,
                    "file restored"
                );
                Ok(FeedOutcome::Completed(self.destination.clone()))
            }
            _ => Ok(FeedOutcome::Collected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkmesh_storage::{split_chunks, CHUNK_SIZE};

    fn content(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
    }

    fn session(dir: &tempfile::TempDir) -> FileRestorer {
        FileRestorer::new(FileId::derive("f", "01/01/2020"), dir.path().join("out/f.bin"))
    }

    #[test]
    fn test_restore_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(3 * CHUNK_SIZE + 17);
        let chunks = split_chunks(&data);
        assert_eq!(chunks.len(), 4);

        let restorer = session(&dir);
        let mut completions = 0;
        for no in [2u32, 3, 0, 3, 1, 2] {
            match restorer.feed(no, chunks[no as usize].clone()).unwrap() {
                FeedOutcome::Completed(path) => {
                    completions += 1;
                    assert_eq!(fs::read(path).unwrap(), data.to_vec());
                }
                FeedOutcome::Collected | FeedOutcome::Ignored => {}
            }
        }
        assert_eq!(completions, 1);
        assert!(restorer.is_complete());
        assert_eq!(restorer.expected_count(), Some(4));
    }

    #[test]
    fn test_exact_multiple_uses_empty_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(2 * CHUNK_SIZE);
        let chunks = split_chunks(&data);
        let restorer = session(&dir);

        assert_eq!(restorer.feed(0, chunks[0].clone()).unwrap(), FeedOutcome::Collected);
        assert_eq!(restorer.feed(1, chunks[1].clone()).unwrap(), FeedOutcome::Collected);
        assert_eq!(restorer.expected_count(), None);

        let outcome = restorer.feed(2, chunks[2].clone()).unwrap();
        assert!(matches!(outcome, FeedOutcome::Completed(_)));
        assert_eq!(fs::read(restorer.destination()).unwrap(), data.to_vec());
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = session(&dir);
        assert!(matches!(restorer.feed(0, Bytes::new()).unwrap(), FeedOutcome::Completed(_)));
        assert!(fs::read(restorer.destination()).unwrap().is_empty());
    }

    #[test]
    fn test_feed_after_complete_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = session(&dir);
        restorer.feed(0, Bytes::from_static(b"tiny")).unwrap();
        assert_eq!(restorer.feed(0, Bytes::from_static(b"tiny")).unwrap(), FeedOutcome::Ignored);
        assert_eq!(restorer.feed(1, Bytes::from_static(b"x")).unwrap(), FeedOutcome::Ignored);
    }

    #[test]
    fn test_out_of_range_terminator_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(CHUNK_SIZE + 40);
        let chunks = split_chunks(&data);
        let restorer = session(&dir);

        assert_eq!(restorer.feed(0, chunks[0].clone()).unwrap(), FeedOutcome::Collected);
        assert_eq!(
            restorer.feed(u32::MAX, Bytes::from_static(b"short")).unwrap(),
            FeedOutcome::Ignored
        );
        assert_eq!(restorer.expected_count(), None);
        assert!(restorer.has(0));

        assert!(matches!(restorer.feed(1, chunks[1].clone()).unwrap(), FeedOutcome::Completed(_)));
        assert_eq!(fs::read(restorer.destination()).unwrap(), data.to_vec());
    }

    #[test]
    fn test_incomplete_without_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = session(&dir);
        let full = Bytes::from(vec![0u8; CHUNK_SIZE]);
        restorer.feed(0, full.clone()).unwrap();
        restorer.feed(1, full).unwrap();
        assert!(restorer.has(1));
        assert!(!restorer.has(2));
        assert_eq!(restorer.collected(), 2);
        assert!(!restorer.is_complete());
        assert!(!restorer.destination().exists());
    }
}
