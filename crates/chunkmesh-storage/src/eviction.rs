//! Victim selection for space reclaim.
//!
//! The default policy evicts the chunk with the highest perceived replication
//! degree. Ties go to the larger chunk, then to the lowest chunk id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;

/// How `ChunkStore::reclaim` picks the next chunk to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Highest perceived replication degree first.
    #[default]
    ReplicationAware,
    /// Smallest chunk first. Only useful when no replication data is available.
    SmallestFirst,
}

/// A stored chunk considered for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// The chunk.
    pub chunk: ChunkId,
    /// Bytes it occupies on disk.
    pub size_bytes: u64,
    /// Locally perceived replication degree, `None` when no record exists.
    pub perceived_degree: Option<usize>,
}

impl EvictionPolicy {
    /// Pick the next victim, `None` if there is nothing left to evict.
    pub fn select<'a>(&self, candidates: &'a [EvictionCandidate]) -> Option<&'a EvictionCandidate> {
        match self {
            EvictionPolicy::ReplicationAware => candidates.iter().max_by(|a, b| {
                a.perceived_degree
                    .cmp(&b.perceived_degree)
                    .then(a.size_bytes.cmp(&b.size_bytes))
                    .then(b.chunk.cmp(&a.chunk))
            }),
            EvictionPolicy::SmallestFirst => candidates.iter().min_by(|a, b| {
                match a.size_bytes.cmp(&b.size_bytes) {
                    Ordering::Equal => a.chunk.cmp(&b.chunk),
                    other => other,
                }
            }),
        }
    }
}
