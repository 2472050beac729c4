//! Data Model
//!
//! Configuration and operational records stored per device, plus the
//! payloads that cross the proxy boundary.

use crate::identity::{DataPath, DeviceId, LogicalStore, MemberId, SourceIdentifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use strum::{Display, EnumString};

/// Device data exchanged with the data tree. Opaque to the coordination layer.
pub type NormalizedNode = serde_json::Value;

pub const DEFAULT_CONNECTION_TIMEOUT_MILLIS: u64 = 20_000;
pub const DEFAULT_BETWEEN_ATTEMPTS_TIMEOUT_MILLIS: u64 = 2_000;
pub const DEFAULT_SLEEP_FACTOR: f64 = 1.5;
pub const DEFAULT_ACTOR_RESPONSE_WAIT_TIME_SECS: u64 = 5;

/// Login credentials for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Per-device configuration record, as written under the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub tcp_only: bool,
    #[serde(default = "default_connection_timeout_millis")]
    pub connection_timeout_millis: u64,
    /// Zero means retry forever.
    #[serde(default)]
    pub max_connection_attempts: u32,
    #[serde(default = "default_between_attempts_timeout_millis")]
    pub between_attempts_timeout_millis: u64,
    #[serde(default = "default_sleep_factor")]
    pub sleep_factor: f64,
    /// Bound on every ask sent to this device's master actor.
    #[serde(default = "default_actor_response_wait_time_secs")]
    pub actor_response_wait_time_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_cache_directory: Option<String>,
}

fn default_connection_timeout_millis() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_MILLIS
}

fn default_between_attempts_timeout_millis() -> u64 {
    DEFAULT_BETWEEN_ATTEMPTS_TIMEOUT_MILLIS
}

fn default_sleep_factor() -> f64 {
    DEFAULT_SLEEP_FACTOR
}

fn default_actor_response_wait_time_secs() -> u64 {
    DEFAULT_ACTOR_RESPONSE_WAIT_TIME_SECS
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            tcp_only: false,
            connection_timeout_millis: DEFAULT_CONNECTION_TIMEOUT_MILLIS,
            max_connection_attempts: 0,
            between_attempts_timeout_millis: DEFAULT_BETWEEN_ATTEMPTS_TIMEOUT_MILLIS,
            sleep_factor: DEFAULT_SLEEP_FACTOR,
            actor_response_wait_time_secs: DEFAULT_ACTOR_RESPONSE_WAIT_TIME_SECS,
            schema_cache_directory: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn with_between_attempts_timeout(mut self, timeout: Duration) -> Self {
        self.between_attempts_timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_actor_response_wait_time(mut self, secs: u64) -> Self {
        self.actor_response_wait_time_secs = secs;
        self
    }

    pub fn with_schema_cache_directory(mut self, directory: &str) -> Self {
        self.schema_cache_directory = Some(directory.to_string());
        self
    }

    pub fn device_id(&self, name: &str) -> DeviceId {
        DeviceId::new(name, self.host.clone(), self.port)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_secs(self.actor_response_wait_time_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_millis)
    }
}

/// Connection status published by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    UnableToConnect,
}

/// Operational record for a device, written by its current owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeStatus {
    pub host: String,
    pub port: u16,
    pub connection_status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_member: Option<MemberId>,
    #[serde(default)]
    pub available_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    pub fn connecting(config: &NodeConfig) -> Self {
        Self::with_status(config, ConnectionStatus::Connecting)
    }

    pub fn connected(config: &NodeConfig, master: MemberId, capabilities: Vec<String>) -> Self {
        Self {
            master_member: Some(master),
            available_capabilities: capabilities,
            ..Self::with_status(config, ConnectionStatus::Connected)
        }
    }

    pub fn unable_to_connect(config: &NodeConfig, error: impl Into<String>) -> Self {
        Self {
            connection_error: Some(error.into()),
            ..Self::with_status(config, ConnectionStatus::UnableToConnect)
        }
    }

    fn with_status(config: &NodeConfig, connection_status: ConnectionStatus) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connection_status,
            master_member: None,
            available_capabilities: Vec::new(),
            connection_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Connection generation a slave should mount, if the device is connected
    /// and its owner is known.
    pub fn mount_key(&self) -> Option<MountKey> {
        if self.connection_status != ConnectionStatus::Connected {
            return None;
        }
        let master = self.master_member.clone()?;
        Some(MountKey {
            host: self.host.clone(),
            port: self.port,
            master,
        })
    }
}

/// One connection generation as observed by slaves. A change in any field
/// requires the previous mount to be closed before a new one is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountKey {
    pub host: String,
    pub port: u16,
    pub master: MemberId,
}

/// Structured error reported by a device alongside an RPC or action result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub tag: String,
    pub message: String,
}

/// Output of an RPC or action invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<NormalizedNode>,
    #[serde(default)]
    pub errors: Vec<RpcError>,
}

impl RpcResult {
    pub fn success(output: Option<NormalizedNode>) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }

    pub fn with_errors(errors: Vec<RpcError>) -> Self {
        Self {
            output: None,
            errors,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Target of an action invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTreeIdentifier {
    pub store: LogicalStore,
    pub path: DataPath,
}

/// Text of one schema module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub id: SourceIdentifier,
    pub text: String,
}

impl SchemaSource {
    pub fn new(id: SourceIdentifier, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Resolved model built from a set of schema sources.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EffectiveSchemaContext {
    pub modules: BTreeSet<SourceIdentifier>,
}

impl EffectiveSchemaContext {
    pub fn new(modules: impl IntoIterator<Item = SourceIdentifier>) -> Self {
        Self {
            modules: modules.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &SourceIdentifier) -> bool {
        self.modules.contains(id)
    }
}
