//! Server Configuration
//!
//! Defaults with environment variable overrides.

use fleetmount_core::MemberId;
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};

/// Default topology watched by the manager.
pub const DEFAULT_TOPOLOGY_ID: &str = "topology-netconf";

/// Backend for the configuration and operational stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DataStoreKind {
    Memory,
    Etcd,
}

/// Server configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This member's cluster address (env: MEMBER_ID)
    pub member_id: MemberId,

    /// Topology whose devices this server manages (env: TOPOLOGY_ID)
    pub topology_id: String,

    /// HTTP bind address (env: BIND_ADDR)
    pub bind_addr: String,

    /// Datastore backend (env: DATASTORE, `memory` or `etcd`)
    pub datastore: DataStoreKind,

    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Key prefix for every record this server writes (env: ETCD_NAMESPACE)
    pub etcd_namespace: String,

    /// TTL of the etcd election lease in seconds (env: ELECTION_LEASE_TTL_SECS)
    pub election_lease_ttl: i64,

    /// Idle period after which a master cancels an open write transaction
    /// (env: WRITE_TX_IDLE_TIMEOUT_SECS, 0 = disabled)
    pub write_tx_idle_timeout: Option<Duration>,

    /// Idle period after which a master closes an open read transaction
    /// (env: READ_TX_IDLE_TIMEOUT_SECS, 0 = disabled)
    pub read_tx_idle_timeout: Option<Duration>,

    // P2P settings
    /// Actor swarm listen port (env: P2P_PORT)
    pub p2p_port: u16,

    /// Peers dialled at startup (env: P2P_PEERS, comma-separated multiaddrs)
    pub p2p_peers: Vec<String>,

    /// Root of the on-disk schema catalog (env: SCHEMA_CATALOG_DIR)
    pub schema_catalog_dir: PathBuf,

    /// Attempts at registering a singleton candidate before giving up
    /// (env: SINGLETON_REGISTRATION_ATTEMPTS)
    pub registration_attempts: u32,

    // Etcd backoff settings
    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,

    /// Delay before re-establishing a broken etcd watch
    pub reconnect_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            member_id: MemberId::new(format!("fleetmount-member-{}", uuid::Uuid::new_v4())),
            topology_id: DEFAULT_TOPOLOGY_ID.to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            datastore: DataStoreKind::Memory,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_namespace: "/fleetmount/".to_string(),
            election_lease_ttl: 15,
            write_tx_idle_timeout: None,
            read_tx_idle_timeout: Some(Duration::from_secs(300)),
            p2p_port: 9000,
            p2p_peers: Vec::new(),
            schema_catalog_dir: PathBuf::from("cache"),
            registration_attempts: 3,
            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(member_id) = lookup("MEMBER_ID") {
            config.member_id = MemberId::new(member_id);
        }

        if let Some(topology_id) = lookup("TOPOLOGY_ID") {
            config.topology_id = topology_id;
        }

        if let Some(bind_addr) = lookup("BIND_ADDR") {
            config.bind_addr = bind_addr;
        }

        if let Some(datastore) = lookup("DATASTORE") {
            match datastore.parse() {
                Ok(kind) => config.datastore = kind,
                Err(_) => tracing::warn!(value = %datastore, "Unknown DATASTORE, using memory"),
            }
        }

        if let Some(endpoints) = lookup("ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints.split(',').map(String::from).collect();
        }

        if let Some(namespace) = lookup("ETCD_NAMESPACE") {
            config.etcd_namespace = namespace;
        }

        if let Some(ttl) = lookup("ELECTION_LEASE_TTL_SECS") {
            if let Ok(parsed) = ttl.parse::<i64>() {
                config.election_lease_ttl = parsed;
            }
        }

        if let Some(timeout) = lookup("WRITE_TX_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                config.write_tx_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        if let Some(timeout) = lookup("READ_TX_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                config.read_tx_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        if let Some(port) = lookup("P2P_PORT") {
            match port.parse() {
                Ok(parsed) => config.p2p_port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid P2P_PORT, using default"),
            }
        }

        if let Some(peers) = lookup("P2P_PEERS") {
            config.p2p_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(dir) = lookup("SCHEMA_CATALOG_DIR") {
            config.schema_catalog_dir = PathBuf::from(dir);
        }

        if let Some(attempts) = lookup("SINGLETON_REGISTRATION_ATTEMPTS") {
            if let Ok(parsed) = attempts.parse::<u32>() {
                config.registration_attempts = parsed.max(1);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.topology_id, "topology-netconf");
        assert_eq!(config.datastore, DataStoreKind::Memory);
        assert_eq!(config.registration_attempts, 3);
        assert!(config.write_tx_idle_timeout.is_none());
        assert_eq!(config.read_tx_idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.p2p_port, 9000);
        assert!(config.p2p_peers.is_empty());
        assert!(config.member_id.as_str().starts_with("fleetmount-member-"));
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("MEMBER_ID", "member-2"),
            ("DATASTORE", "ETCD"),
            ("ETCD_ENDPOINTS", "http://a:2379,http://b:2379"),
            ("WRITE_TX_IDLE_TIMEOUT_SECS", "30"),
            ("SINGLETON_REGISTRATION_ATTEMPTS", "0"),
            ("P2P_PORT", "9100"),
            ("P2P_PEERS", "/ip4/10.0.0.2/udp/9100/quic-v1, ,/ip4/10.0.0.3/udp/9100/quic-v1"),
        ]));
        assert_eq!(config.member_id, MemberId::new("member-2"));
        assert_eq!(config.datastore, DataStoreKind::Etcd);
        assert_eq!(config.etcd_endpoints.len(), 2);
        assert_eq!(config.write_tx_idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.registration_attempts, 1);
        assert_eq!(config.p2p_port, 9100);
        assert_eq!(
            config.p2p_peers,
            vec!["/ip4/10.0.0.2/udp/9100/quic-v1", "/ip4/10.0.0.3/udp/9100/quic-v1"]
        );
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("WRITE_TX_IDLE_TIMEOUT_SECS", "0"),
            ("READ_TX_IDLE_TIMEOUT_SECS", "0"),
        ]));
        assert!(config.write_tx_idle_timeout.is_none());
        assert!(config.read_tx_idle_timeout.is_none());
    }
}
