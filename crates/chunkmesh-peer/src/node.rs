//! Peer process wiring.
//!
//! `Peer::start` opens the chunk store, joins the three multicast groups,
//! starts one receive loop per group on its own worker pool and, depending
//! on the local protocol version, the direct restore listener and the AHOY
//! greeting.

use std::sync::Arc;
use std::time::Duration;

use chunkmesh_storage::ChunkStore;
use chunkmesh_transport::{ChannelKind, DirectListener, GroupChannel, TcpDirectSender, WorkerPool};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::PeerConfig;
use crate::control::LocalControl;
use crate::engine::{Channels, ReplicationEngine};
use crate::error::Result;

/// Delay between the channels going live and the AHOY greeting.
const AHOY_DELAY: Duration = Duration::from_millis(500);

/// A running peer.
pub struct Peer {
    engine: ReplicationEngine,
    control: LocalControl,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Open local state, join the groups and start serving.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        let store = Arc::new(ChunkStore::open(config.store_config())?);
        tokio::fs::create_dir_all(config.restored_dir()).await?;

        let control = GroupChannel::bind(&config.group_config(ChannelKind::Control)?)?;
        let backup = GroupChannel::bind(&config.group_config(ChannelKind::Backup)?)?;
        let restore = GroupChannel::bind(&config.group_config(ChannelKind::Restore)?)?;
        let channels = Channels {
            control: Arc::new(control.clone()),
            backup: Arc::new(backup.clone()),
            restore: Arc::new(restore.clone()),
            direct: Arc::new(TcpDirectSender::default()),
        };

        let version = config.protocol_version;
        let workers = config.workers_per_channel;
        let queue_depth = config.queue_depth;
        let direct_port = config.direct_port()?;
        let engine = ReplicationEngine::new(config, store, channels);
        let handler = Arc::new(engine.clone());

        let group_channels = vec![control, backup, restore];
        let mut tasks: Vec<JoinHandle<()>> = group_channels
            .iter()
            .map(|channel| {
                let pool = WorkerPool::new(&channel.kind().to_string(), workers, queue_depth);
                channel.start_receiving(Arc::clone(&handler), pool)
            })
            .collect();

        if version.restore_enhanced() {
            let listener = DirectListener::bind(direct_port).await?;
            let pool = WorkerPool::new("direct", workers, queue_depth);
            tasks.push(listener.start(Arc::clone(&handler), pool));
        }

        if version.delete_enhanced() {
            let greeter = engine.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(AHOY_DELAY).await;
                greeter.announce().await;
            }));
        }

        info!(
            peer = %engine.peer_id(),
            version = %version,
            dir = %engine.config().peer_dir().display(),
            "peer started"
        );
        Ok(Self {
            control: LocalControl::with_channels(engine.clone(), group_channels),
            engine,
            tasks,
        })
    }

    /// The local control surface.
    pub fn control(&self) -> &LocalControl {
        &self.control
    }

    /// The replication engine.
    pub fn engine(&self) -> &ReplicationEngine {
        &self.engine
    }

    /// Stop the receive loops. Tasks already spawned by the engine run to completion.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(peer = %self.engine.peer_id(), "peer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use chunkmesh_storage::PeerId;
    use chunkmesh_transport::TransportError;

    #[tokio::test]
    async fn test_start_rejects_unicast_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = PeerConfig {
            peer_id: PeerId(2),
            data_dir: dir.path().to_path_buf(),
            control: String::from("10.1.2.3:8001"),
            ..Default::default()
        };

        let result = Peer::start(config.clone()).await;
        assert!(matches!(
            result,
            Err(PeerError::Transport(TransportError::NotMulticast { .. }))
        ));
        assert!(config.restored_dir().is_dir());
    }
}
