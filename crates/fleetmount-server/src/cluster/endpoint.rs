//! Actor Endpoint
//!
//! A device actor as seen by a caller: either spawned in this process or
//! reached through the actor swarm.

use crate::actors::DeviceActor;
use fleetmount_core::DeviceError;
use kameo::actor::{ActorRef, RemoteActorRef};
use kameo::error::{RemoteSendError, SendError};
use kameo::message::Message;
use kameo::remote::RemoteMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub enum ActorEndpoint {
    Local(ActorRef<DeviceActor>),
    Remote(RemoteActorRef<DeviceActor>),
}

/// Why an ask produced no reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskFailure {
    /// The handler ran and returned an error.
    Rejected(DeviceError),
    /// Nothing came back within the bound.
    TimedOut,
    Unreachable(String),
}

impl fmt::Display for AskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{e}"),
            Self::TimedOut => write!(f, "no reply in time"),
            Self::Unreachable(reason) => write!(f, "{reason}"),
        }
    }
}

impl ActorEndpoint {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Asks and waits at most `timeout` for the reply.
    pub async fn ask<M, T>(&self, msg: M, timeout: Duration) -> Result<T, AskFailure>
    where
        DeviceActor: Message<M, Reply = Result<T, DeviceError>> + RemoteMessage<M>,
        M: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        match self {
            Self::Local(actor) => match tokio::time::timeout(timeout, actor.ask(msg).send()).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(SendError::HandlerError(e))) => Err(AskFailure::Rejected(e)),
                Ok(Err(SendError::Timeout(_))) | Err(_) => Err(AskFailure::TimedOut),
                Ok(Err(e)) => Err(AskFailure::Unreachable(e.to_string())),
            },
            Self::Remote(actor) => {
                let request = actor.ask(&msg).reply_timeout(timeout).send();
                match tokio::time::timeout(timeout, request).await {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(RemoteSendError::HandlerError(e))) => Err(AskFailure::Rejected(e)),
                    Ok(Err(RemoteSendError::ReplyTimeout | RemoteSendError::NetworkTimeout)) | Err(_) => {
                        Err(AskFailure::TimedOut)
                    }
                    Ok(Err(e)) => Err(AskFailure::Unreachable(e.to_string())),
                }
            }
        }
    }

    /// Fire-and-forget send. Only delivery into the mailbox is confirmed.
    pub async fn tell<M>(&self, msg: M) -> Result<(), AskFailure>
    where
        DeviceActor: Message<M, Reply = ()> + RemoteMessage<M>,
        M: Serialize + Send + Sync + 'static,
    {
        match self {
            Self::Local(actor) => actor
                .tell(msg)
                .send()
                .await
                .map_err(|e| AskFailure::Unreachable(e.to_string())),
            Self::Remote(actor) => actor
                .tell(&msg)
                .send()
                .await
                .map_err(|e| AskFailure::Unreachable(e.to_string())),
        }
    }
}

impl fmt::Debug for ActorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(actor) => write!(f, "Local({})", actor.id()),
            Self::Remote(actor) => write!(f, "Remote({})", actor.id()),
        }
    }
}

impl From<ActorRef<DeviceActor>> for ActorEndpoint {
    fn from(actor: ActorRef<DeviceActor>) -> Self {
        Self::Local(actor)
    }
}
