//! Error Types
//!
//! Errors are cloneable and serializable so a master can hand them back to a
//! proxy as the reply to an ask.

use crate::identity::{DataPath, DeviceId, LogicalStore, QName, SourceIdentifier, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of an operation against a device, local or proxied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DeviceError {
    /// Request reached an actor that does not (or no longer) hold device services.
    #[error("{device}: this actor is not the master for the device yet")]
    NotMaster { device: String },

    #[error("schema source {0} is not available")]
    MissingSchemaSource(SourceIdentifier),

    #[error("{device}: no reply from master within {timeout_ms} ms, master is down")]
    AskTimeout { device: String, timeout_ms: u64 },

    #[error("{device}: master actor unreachable: {reason}")]
    MasterUnreachable { device: String, reason: String },

    #[error("{device}: read of {path} in {store} failed: {cause}")]
    ReadFailed {
        device: String,
        store: LogicalStore,
        path: DataPath,
        cause: Box<DeviceError>,
    },

    #[error("{device}: commit failed: {cause}")]
    CommitFailed {
        device: String,
        cause: Box<DeviceError>,
    },

    #[error("rpc {name} failed: {message}")]
    RpcFailed { name: QName, message: String },

    #[error("action {name} failed: {message}")]
    ActionFailed { name: QName, message: String },

    #[error("transaction {0} is already closed")]
    TransactionClosed(TransactionId),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("device operation failed: {0}")]
    Operation(String),
}

impl DeviceError {
    pub fn not_master(device: &DeviceId) -> Self {
        Self::NotMaster {
            device: device.to_string(),
        }
    }

    pub fn read_failed(device: &DeviceId, store: LogicalStore, path: &DataPath, cause: DeviceError) -> Self {
        Self::ReadFailed {
            device: device.to_string(),
            store,
            path: path.clone(),
            cause: Box::new(cause),
        }
    }

    /// Wraps a failure as a commit failure unless it already is one.
    pub fn commit_failed(device: &DeviceId, cause: DeviceError) -> Self {
        match cause {
            already @ Self::CommitFailed { .. } => already,
            cause => Self::CommitFailed {
                device: device.to_string(),
                cause: Box::new(cause),
            },
        }
    }

    /// Innermost error, following read and commit wrappers.
    pub fn root_cause(&self) -> &DeviceError {
        let mut current = self;
        loop {
            match current {
                Self::ReadFailed { cause, .. } | Self::CommitFailed { cause, .. } => {
                    current = cause.as_ref();
                }
                other => return other,
            }
        }
    }

    pub fn is_ask_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::AskTimeout { .. })
    }
}

/// Failure while fetching or resolving schema sources.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SchemaError {
    #[error("no provider registered for schema source {0}")]
    MissingSource(SourceIdentifier),

    #[error("schema source {id} could not be fetched: {cause}")]
    SourceUnavailable { id: SourceIdentifier, cause: DeviceError },

    #[error("schema source {id} is unresolvable: {reason}")]
    Unresolvable { id: SourceIdentifier, reason: String },
}

impl SchemaError {
    /// True when the failure was caused by a remote ask timing out. Such
    /// failures are transient and worth one more resolution attempt.
    pub fn is_ask_timeout(&self) -> bool {
        match self {
            Self::SourceUnavailable { cause, .. } => cause.is_ask_timeout(),
            _ => false,
        }
    }
}

/// Cluster singleton registration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("candidate {0} is already registered")]
    AlreadyRegistered(String),

    #[error("singleton registration for {identifier} failed: {reason}")]
    Failed { identifier: String, reason: String },
}

/// Datastore backend failure.
#[derive(Debug, Clone, Error)]
pub enum DataStoreError {
    #[error("datastore backend error: {0}")]
    Backend(String),

    #[error("invalid record at {key}: {reason}")]
    Serialization { key: String, reason: String },
}

/// Local mount-point registry failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("a mount point for {0} is already registered")]
    AlreadyMounted(String),
}

/// Incomplete topology setup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("topology setup is missing {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> DeviceError {
        DeviceError::AskTimeout {
            device: "RemoteDevice{node-1}".to_string(),
            timeout_ms: 5000,
        }
    }

    #[test]
    fn test_root_cause_unwraps_wrappers() {
        let device = DeviceId::new("node-1", "127.0.0.1", 1234);
        let read = DeviceError::read_failed(&device, LogicalStore::Configuration, &DataPath::root(), timeout());
        let commit = DeviceError::commit_failed(&device, read);
        assert_eq!(commit.root_cause(), &timeout());
        assert!(commit.is_ask_timeout());
    }

    #[test]
    fn test_commit_failed_is_not_double_wrapped() {
        let device = DeviceId::new("node-1", "127.0.0.1", 1234);
        let once = DeviceError::commit_failed(&device, DeviceError::Operation("boom".into()));
        let twice = DeviceError::commit_failed(&device, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_schema_error_ask_timeout_classification() {
        let id = SourceIdentifier::new("sim-device", Some("2024-01-01"));
        let transient = SchemaError::SourceUnavailable {
            id: id.clone(),
            cause: timeout(),
        };
        assert!(transient.is_ask_timeout());

        let missing = SchemaError::SourceUnavailable {
            id: id.clone(),
            cause: DeviceError::MissingSchemaSource(id.clone()),
        };
        assert!(!missing.is_ask_timeout());
        assert!(!SchemaError::Unresolvable {
            id,
            reason: "bad header".into()
        }
        .is_ask_timeout());
    }

    #[test]
    fn test_errors_survive_serialization() {
        let err = DeviceError::RpcFailed {
            name: QName::new("sim:fail"),
            message: "device said no".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: DeviceError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
