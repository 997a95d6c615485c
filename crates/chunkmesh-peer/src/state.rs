//! The `state()` report.

use std::fmt;
use std::path::PathBuf;

use chunkmesh_storage::{ChunkId, FileId, PeerId, StoredChunkInfo};
use chunkmesh_transport::{ChannelKind, ChannelStatsSnapshot, GroupChannel, ProtocolVersion};
use serde::Serialize;

use crate::engine::ReplicationEngine;

/// Replication of one chunk of an owned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReplication {
    /// Position within the file.
    pub chunk_no: u32,
    /// Peers believed to hold the chunk.
    pub perceived_degree: usize,
}

/// A file this peer backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedFileState {
    /// Path it was backed up from.
    pub path: PathBuf,
    /// Its identifier.
    pub file_id: FileId,
    /// Desired replication degree.
    pub desired_degree: u32,
    /// Per-chunk perceived replication.
    pub chunks: Vec<ChunkReplication>,
}

/// Traffic counters of one group channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    /// Which group.
    pub kind: ChannelKind,
    /// Group address.
    pub group: String,
    /// Counters.
    pub stats: ChannelStatsSnapshot,
}

/// Read-only snapshot of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerState {
    /// This peer.
    pub peer_id: PeerId,
    /// Protocol version spoken.
    pub protocol_version: ProtocolVersion,
    /// Files backed up from this peer.
    pub owned_files: Vec<OwnedFileState>,
    /// Chunks held on behalf of other peers.
    pub stored_chunks: Vec<StoredChunkInfo>,
    /// Storage budget in bytes.
    pub capacity_bytes: u64,
    /// Bytes occupied by held chunks.
    pub occupied_bytes: u64,
    /// Chunks still waiting for DELETED acknowledgments.
    pub pending_deletions: usize,
    /// Restore sessions in progress.
    pub active_restores: usize,
    /// Per-channel traffic counters.
    pub channels: Vec<ChannelReport>,
}

impl PeerState {
    /// Gather the report from `engine` and the bound `channels`.
    pub fn collect(engine: &ReplicationEngine, channels: &[GroupChannel]) -> Self {
        let store = engine.store();
        let mut owned_files: Vec<OwnedFileState> = store
            .owned_files()
            .into_iter()
            .map(|owned| OwnedFileState {
                chunks: (0..owned.chunk_count)
                    .map(|chunk_no| ChunkReplication {
                        chunk_no,
                        perceived_degree: store
                            .perceived_degree(&ChunkId::new(owned.file_id.clone(), chunk_no))
                            .unwrap_or(0),
                    })
                    .collect(),
                path: owned.path,
                file_id: owned.file_id,
                desired_degree: owned.desired_degree,
            })
            .collect();
        owned_files.sort_by(|a, b| a.path.cmp(&b.path));

        Self {
            peer_id: engine.peer_id(),
            protocol_version: engine.version(),
            owned_files,
            stored_chunks: store.stored_chunks(),
            capacity_bytes: store.capacity_bytes(),
            occupied_bytes: store.occupied_bytes(),
            pending_deletions: store.pending_deletion_count(),
            active_restores: engine.active_sessions(),
            channels: channels
                .iter()
                .map(|channel| ChannelReport {
                    kind: channel.kind(),
                    group: channel.group().to_string(),
                    stats: channel.stats(),
                })
                .collect(),
        }
    }

    /// Bytes still available under the budget.
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.occupied_bytes)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "peer {} (protocol {})", self.peer_id, self.protocol_version)?;

        writeln!(f, "\nfiles:")?;
        if self.owned_files.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for file in &self.owned_files {
            writeln!(f, "  {}", file.path.display())?;
            writeln!(f, "    id: {}", file.file_id)?;
            writeln!(f, "    desired degree: {}", file.desired_degree)?;
            for chunk in &file.chunks {
                writeln!(f, "    chunk {}: perceived {}", chunk.chunk_no, chunk.perceived_degree)?;
            }
        }

        writeln!(f, "\nchunks:")?;
        if self.stored_chunks.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for info in &self.stored_chunks {
            let perceived = info
                .perceived_degree
                .map_or_else(|| "-".to_string(), |d| d.to_string());
            let desired = info
                .desired_degree
                .map_or_else(|| "-".to_string(), |d| d.to_string());
            writeln!(
                f,
                "  {}: {} KB, perceived {}, desired {}",
                info.chunk,
                info.size_bytes / 1000,
                perceived,
                desired
            )?;
        }

        writeln!(f, "\nspace:")?;
        writeln!(f, "  capacity: {} KB", self.capacity_bytes / 1000)?;
        writeln!(f, "  used: {} KB", self.occupied_bytes / 1000)?;
        writeln!(f, "  free: {} KB", self.free_bytes() / 1000)?;
        if self.pending_deletions > 0 {
            writeln!(f, "  chunks awaiting delete acks: {}", self.pending_deletions)?;
        }
        if self.active_restores > 0 {
            writeln!(f, "  restores in progress: {}", self.active_restores)?;
        }

        if !self.channels.is_empty() {
            writeln!(f, "\nchannels:")?;
            for channel in &self.channels {
                let s = channel.stats;
                writeln!(
                    f,
                    "  {} {}: received {}, dispatched {}, dropped {}, sent {}, send errors {}",
                    channel.kind,
                    channel.group,
                    s.received,
                    s.dispatched,
                    s.dropped,
                    s.sent,
                    s.send_errors
                )?;
            }
        }
        Ok(())
    }
}
