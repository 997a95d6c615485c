//! Whole-store snapshot persistence.
//!
//! The snapshot is a single bincode blob written to a temporary file, synced
//! and renamed over the previous one, so a crash mid-write leaves the last
//! complete snapshot in place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkId, FileId, PeerId};
use crate::error::{StorageError, StorageResult};
use crate::store::OwnedFile;

/// Everything a peer must remember across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Local space budget in bytes.
    pub capacity_bytes: u64,
    /// Chunks held on disk and their sizes.
    pub stored: BTreeMap<ChunkId, u64>,
    /// Desired replication degree per file.
    pub desired: BTreeMap<FileId, u32>,
    /// Believed holders per chunk.
    pub holders: BTreeMap<ChunkId, BTreeSet<PeerId>>,
    /// Files this peer originated.
    pub owned: BTreeMap<FileId, OwnedFile>,
    /// Holders still expected to acknowledge deletion.
    pub marked_for_deletion: BTreeMap<ChunkId, BTreeSet<PeerId>>,
}

impl StoreSnapshot {
    /// Write the snapshot atomically to `path`.
    pub fn write_to(&self, path: &Path) -> StorageResult<()> {
        let encoded = bincode::serialize(self)?;

        let mut tmp_path = path.to_path_buf();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Read a snapshot, `None` if none was ever written.
    pub fn read_from(path: &Path) -> StorageResult<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::IoError(e)),
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StorageError::CorruptSnapshot {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}
