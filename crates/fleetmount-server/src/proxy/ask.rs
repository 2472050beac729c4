//! Bounded ask to a master actor.

use crate::actors::DeviceActor;
use crate::cluster::{ActorEndpoint, AskFailure};
use crate::observability::metrics;
use fleetmount_core::{DeviceError, DeviceId};
use kameo::message::Message;
use kameo::remote::RemoteMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::trace;

/// Address of one device's master plus the bound applied to every ask.
#[derive(Clone)]
pub struct MasterHandle {
    pub device_id: DeviceId,
    pub master: ActorEndpoint,
    pub timeout: Duration,
}

impl MasterHandle {
    pub fn new(device_id: DeviceId, master: impl Into<ActorEndpoint>, timeout: Duration) -> Self {
        Self {
            device_id,
            master: master.into(),
            timeout,
        }
    }

    /// Sends `msg` and waits for the reply. Remote failures come back as the
    /// master's own error; no reply within the timeout is `AskTimeout`.
    pub async fn ask<M, T>(&self, request: &'static str, msg: M) -> Result<T, DeviceError>
    where
        DeviceActor: Message<M, Reply = Result<T, DeviceError>> + RemoteMessage<M>,
        M: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let started = Instant::now();
        let result = self.master.ask(msg, self.timeout).await.map_err(|failure| match failure {
            AskFailure::Rejected(e) => e,
            AskFailure::TimedOut => self.timed_out(),
            AskFailure::Unreachable(reason) => DeviceError::MasterUnreachable {
                device: self.device_id.to_string(),
                reason,
            },
        });

        let outcome = match &result {
            Ok(_) => "success",
            Err(DeviceError::AskTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        metrics::record_proxy_ask(request, outcome, started.elapsed());
        trace!(device = %self.device_id, request, outcome, "Proxy ask completed");
        result
    }

    fn timed_out(&self) -> DeviceError {
        DeviceError::AskTimeout {
            device: self.device_id.to_string(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
