use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkmesh_storage::{EvictionPolicy, PeerId, StoreConfig};
use chunkmesh_transport::{BackoffSchedule, ChannelKind, GroupChannelConfig, ProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::error::{PeerError, Result};

/// Peer configuration, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// This peer's id; unique among peers sharing the groups.
    pub peer_id: PeerId,
    /// Protocol version this peer speaks.
    pub protocol_version: ProtocolVersion,
    /// Parent directory of the per-peer state directory.
    pub data_dir: PathBuf,
    /// Control group, `ip:port`.
    pub control: String,
    /// Backup group, `ip:port`.
    pub backup: String,
    /// Restore group, `ip:port`.
    pub restore: String,
    /// Interface to join the groups on.
    pub interface: Ipv4Addr,
    /// Multicast TTL.
    pub multicast_ttl: u32,
    /// Port for direct CHUNK deliveries; defaults to the restore group port.
    pub restore_tcp_port: Option<u16>,
    /// Initial local storage budget in bytes.
    pub max_storage_bytes: u64,
    /// Concurrent handler tasks per channel.
    pub workers_per_channel: usize,
    /// Datagrams allowed to wait for a handler per channel.
    pub queue_depth: usize,
    /// Upper bound of randomized reaction delays.
    pub jitter_max_ms: u64,
    /// First backoff delay of PUTCHUNK/GETCHUNK retry loops.
    pub backoff_initial_ms: u64,
    /// Sends per retry loop.
    pub max_attempts: u32,
    /// Delay before the backup watchdog re-checks a stored chunk.
    pub watchdog_delay_ms: u64,
    /// PUTCHUNK observations at which the watchdog trusts the initiator.
    pub watchdog_request_threshold: u32,
    /// How many times DELETE is broadcast.
    pub delete_repeats: u32,
    /// Gap between DELETE broadcasts.
    pub delete_interval_ms: u64,
    /// Restore sessions not completed within this window are discarded.
    pub restore_timeout_ms: u64,
    /// Reclaim victim selection.
    pub eviction_policy: EvictionPolicy,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId(1),
            protocol_version: ProtocolVersion::V1_0,
            data_dir: PathBuf::from("peers"),
            control: String::from("224.0.0.15:8001"),
            backup: String::from("224.0.0.15:8002"),
            restore: String::from("224.0.0.15:8003"),
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            restore_tcp_port: None,
            max_storage_bytes: 6_400_000,
            workers_per_channel: 8,
            queue_depth: 256,
            jitter_max_ms: 400,
            backoff_initial_ms: 1000,
            max_attempts: 5,
            watchdog_delay_ms: 35_000,
            watchdog_request_threshold: 5,
            delete_repeats: 5,
            delete_interval_ms: 500,
            restore_timeout_ms: 60_000,
            eviction_policy: EvictionPolicy::ReplicationAware,
        }
    }
}

impl PeerConfig {
    /// Load a `.toml` or `.json` file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| PeerError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            "json" => serde_json::from_str(&contents).map_err(|e| PeerError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            _ => Err(PeerError::Config {
                reason: format!("unsupported config file extension: {:?}", ext),
            }),
        }
    }

    /// Directory holding this peer's chunks, snapshot and restored files.
    pub fn peer_dir(&self) -> PathBuf {
        self.data_dir.join(format!("peer{}", self.peer_id))
    }

    /// Directory restored files are written to.
    pub fn restored_dir(&self) -> PathBuf {
        self.peer_dir().join("restored")
    }

    /// Chunk store settings derived from this config.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            root: self.peer_dir(),
            peer_id: self.peer_id,
            capacity_bytes: self.max_storage_bytes,
            jitter_max: self.jitter_max(),
            eviction: self.eviction_policy,
        }
    }

    /// Socket settings for one of the three groups.
    pub fn group_config(&self, kind: ChannelKind) -> Result<GroupChannelConfig> {
        let addr = match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Backup => &self.backup,
            ChannelKind::Restore => &self.restore,
        };
        let mut config = GroupChannelConfig::new(kind, GroupChannelConfig::parse_group(addr)?);
        config.interface = self.interface;
        config.ttl = self.multicast_ttl;
        Ok(config)
    }

    /// Port used for direct CHUNK deliveries.
    pub fn direct_port(&self) -> Result<u16> {
        match self.restore_tcp_port {
            Some(port) => Ok(port),
            None => Ok(GroupChannelConfig::parse_group(&self.restore)?.port()),
        }
    }

    /// Retry schedule for PUTCHUNK and GETCHUNK.
    pub fn backoff(&self) -> BackoffSchedule {
        BackoffSchedule::new(self.max_attempts, Duration::from_millis(self.backoff_initial_ms))
    }

    /// Upper bound of randomized reaction delays.
    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.jitter_max_ms)
    }

    /// Backup watchdog delay.
    pub fn watchdog_delay(&self) -> Duration {
        Duration::from_millis(self.watchdog_delay_ms)
    }

    /// Gap between DELETE broadcasts.
    pub fn delete_interval(&self) -> Duration {
        Duration::from_millis(self.delete_interval_ms)
    }

    /// Restore session timeout.
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_config(suffix: &str) -> NamedTempFile {
        tempfile::Builder::new().suffix(suffix).tempfile().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = PeerConfig::default();
        assert_eq!(config.protocol_version, ProtocolVersion::V1_0);
        assert_eq!(config.max_storage_bytes, 6_400_000);
        assert_eq!(config.jitter_max(), Duration::from_millis(400));
        assert_eq!(config.backoff(), BackoffSchedule::default());
        assert_eq!(config.watchdog_delay(), Duration::from_secs(35));
        assert_eq!(config.delete_repeats, 5);
        assert_eq!(config.eviction_policy, EvictionPolicy::ReplicationAware);
    }

    #[test]
    fn test_peer_dir_layout() {
        let config = PeerConfig {
            peer_id: PeerId(7),
            data_dir: PathBuf::from("/srv/mesh"),
            ..Default::default()
        };
        assert_eq!(config.peer_dir(), PathBuf::from("/srv/mesh/peer7"));
        assert_eq!(config.restored_dir(), PathBuf::from("/srv/mesh/peer7/restored"));
        assert_eq!(config.store_config().root, config.peer_dir());
    }

    #[test]
    fn test_direct_port_defaults_to_restore_group() {
        let mut config = PeerConfig::default();
        assert_eq!(config.direct_port().unwrap(), 8003);
        config.restore_tcp_port = Some(9100);
        assert_eq!(config.direct_port().unwrap(), 9100);
    }

    #[test]
    fn test_group_config_rejects_unicast() {
        let config = PeerConfig {
            backup: String::from("192.168.1.4:8002"),
            ..Default::default()
        };
        assert!(config.group_config(ChannelKind::Control).is_ok());
        assert!(matches!(
            config.group_config(ChannelKind::Backup),
            Err(PeerError::Transport(_))
        ));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = temp_config(".toml");
        writeln!(
            file,
            r#"
peer_id = 3
protocol_version = "1.3"
max_storage_bytes = 1000
eviction_policy = "smallest_first"
"#
        )
        .unwrap();

        let config = PeerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.peer_id, PeerId(3));
        assert_eq!(config.protocol_version, ProtocolVersion::new(1, 3));
        assert_eq!(config.max_storage_bytes, 1000);
        assert_eq!(config.eviction_policy, EvictionPolicy::SmallestFirst);
        assert_eq!(config.delete_repeats, 5);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = temp_config(".json");
        write!(file, r#"{{"peer_id": 9, "protocol_version": "2.0", "jitter_max_ms": 0}}"#).unwrap();

        let config = PeerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.peer_id, PeerId(9));
        assert!(config.protocol_version.delete_enhanced());
        assert_eq!(config.jitter_max(), Duration::ZERO);
    }

    #[test]
    fn test_bad_version_and_extension() {
        let mut file = temp_config(".toml");
        writeln!(file, r#"protocol_version = "one""#).unwrap();
        assert!(matches!(
            PeerConfig::from_file(file.path()),
            Err(PeerError::Config { .. })
        ));

        let file = temp_config(".yaml");
        assert!(matches!(
            PeerConfig::from_file(file.path()),
            Err(PeerError::Config { .. })
        ));
    }
}
