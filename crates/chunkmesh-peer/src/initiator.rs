//! Initiator-side tasks: chunk backup and restore requests, the backup
//! watchdog, DELETE rebroadcast and the AHOY greeting.
//!
//! Every task here is fire-and-forget with a bounded budget. Outcomes are
//! logged; nothing is reported back to the peers involved.

use bytes::Bytes;
use chunkmesh_storage::{ChunkId, FileId};
use chunkmesh_transport::{jitter_delay, Message, RetryOutcome};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ReplicationEngine;

impl ReplicationEngine {
    /// Push one chunk with PUTCHUNK until `desired_degree` holders are observed
    /// or the attempt budget is spent.
    pub async fn request_chunk_backup(&self, chunk: ChunkId, desired_degree: u32, data: Bytes) -> RetryOutcome {
        let payload = Message::PutChunk {
            header: self.header(),
            chunk: chunk.clone(),
            desired_degree,
            body: data,
        }
        .encode();
        let backup = &self.inner.channels.backup;
        let store = &self.inner.store;

        let outcome = self
            .inner
            .config
            .backoff()
            .run(
                |attempt| {
                    debug!(peer = %self.peer_id(), %chunk, attempt, "PUTCHUNK");
                    backup.send(payload.clone())
                },
                || store.perceived_degree(&chunk).unwrap_or(0) >= desired_degree as usize,
            )
            .await;

        let perceived = store.perceived_degree(&chunk).unwrap_or(0);
        if outcome.is_satisfied() {
            debug!(peer = %self.peer_id(), %chunk, perceived, "chunk backed up");
        } else {
            warn!(
                peer = %self.peer_id(),
                %chunk,
                perceived,
                desired = desired_degree,
                attempts = outcome.attempts(),
                "replication degree not met"
            );
        }
        outcome
    }

    /// Run `request_chunk_backup` as an independent task.
    pub fn spawn_chunk_backup(&self, chunk: ChunkId, desired_degree: u32, data: Bytes) -> JoinHandle<RetryOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.request_chunk_backup(chunk, desired_degree, data).await })
    }

    /// Ask for one chunk with GETCHUNK until the restore session has it or
    /// goes away.
    pub async fn request_chunk_restore(&self, chunk: ChunkId) -> RetryOutcome {
        let payload = Message::GetChunk {
            header: self.header(),
            chunk: chunk.clone(),
        }
        .encode();
        let control = &self.inner.channels.control;

        let outcome = self
            .inner
            .config
            .backoff()
            .run(
                |attempt| {
                    debug!(peer = %self.peer_id(), %chunk, attempt, "GETCHUNK");
                    control.send(payload.clone())
                },
                || match self.session(&chunk.file_id) {
                    Some(session) => session.has(chunk.chunk_no),
                    None => true,
                },
            )
            .await;

        if !outcome.is_satisfied() {
            warn!(peer = %self.peer_id(), %chunk, "no reply to GETCHUNK");
        }
        outcome
    }

    /// Run `request_chunk_restore` as an independent task.
    pub fn spawn_chunk_restore(&self, chunk: ChunkId) -> JoinHandle<RetryOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.request_chunk_restore(chunk).await })
    }

    /// Backup watchdog for a chunk this peer stored or is repairing.
    ///
    /// After the watchdog delay, if the chunk is still under-replicated and
    /// fewer PUTCHUNKs than the threshold were observed, the initiator is
    /// presumed gone and this peer pushes the chunk itself from local bytes.
    pub(crate) async fn track_backup(&self, chunk: ChunkId) {
        let config = &self.inner.config;
        let store = &self.inner.store;
        tokio::time::sleep(config.watchdog_delay()).await;

        if !store.has_chunk(&chunk) {
            self.inner.backup_requests.remove(&chunk);
            return;
        }
        let requests = self.backup_requests(&chunk);
        if requests.is_some_and(|count| count >= config.watchdog_request_threshold) {
            self.inner.backup_requests.remove(&chunk);
            debug!(peer = %self.peer_id(), %chunk, "initiator finished its retries");
            return;
        }

        let (Some(desired), perceived) = (
            store.desired_degree(&chunk.file_id),
            store.perceived_degree(&chunk).unwrap_or(0),
        ) else {
            self.inner.backup_requests.remove(&chunk);
            return;
        };
        self.inner.backup_requests.remove(&chunk);
        if perceived >= desired as usize {
            debug!(peer = %self.peer_id(), %chunk, "backup complete");
            return;
        }

        info!(
            peer = %self.peer_id(),
            %chunk,
            perceived,
            desired,
            "backup stalled, taking over"
        );
        tokio::time::sleep(jitter_delay(config.jitter_max())).await;
        if self.inner.backup_requests.contains_key(&chunk) {
            debug!(peer = %self.peer_id(), %chunk, "another peer took over");
            return;
        }
        match store.read_chunk(&chunk) {
            Ok(data) => {
                self.request_chunk_backup(chunk, desired, data).await;
            }
            Err(e) => warn!(peer = %self.peer_id(), %chunk, error = %e, "cannot read chunk for takeover"),
        }
    }

    /// Broadcast DELETE for `file_id` the configured number of times.
    pub async fn broadcast_delete(&self, file_id: FileId) {
        let config = &self.inner.config;
        for round in 0..config.delete_repeats {
            if round > 0 {
                tokio::time::sleep(config.delete_interval()).await;
            }
            let message = Message::Delete {
                header: self.header(),
                file_id: file_id.clone(),
            };
            if !self.send_control(message).await {
                warn!(peer = %self.peer_id(), file = %file_id, round, "DELETE send failed");
            }
        }
    }

    /// Greet the group so peers can re-issue deletions this peer missed.
    pub async fn announce(&self) -> bool {
        info!(peer = %self.peer_id(), version = %self.version(), "sending AHOY");
        self.send_control(Message::Ahoy { header: self.header() }).await
    }
}
