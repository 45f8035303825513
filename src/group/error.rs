use std::time::Duration;

use crate::group::ids::UserId;
use crate::group::versions::{IncompatibleVersion, Versions};

/// Errors surfaced by a Host or Client. They are `Clone` because the same failure is typically
///  delivered to several waiters (both completions of a message, every caller of a ping round)
///  and through the event channel.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Incompatibility(#[from] IncompatibilityError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// Something referenced state that this peer does not track, e.g. an acknowledgment for an
    ///  unknown serial id. This is never expected in correct operation.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("incompatible with host: {incompatible_versions:?} (local versions {local_versions:?}, host versions {host_versions:?})")]
pub struct IncompatibilityError {
    pub incompatible_versions: Vec<IncompatibleVersion>,
    pub local_versions: Versions,
    pub host_versions: Versions,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("timeout: {operation} did not complete within {timeout:?}")]
pub struct TimeoutError {
    pub operation: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("peer is not open")]
    NotOpen,
    #[error("peer is already open")]
    AlreadyOpen,
    #[error("operation targets the peer's own user {0:?}")]
    SelfReference(UserId),
    #[error("host does not know user {0:?} - reconnect failed")]
    ReconnectFailed(UserId),
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Accompanies errors reported through a peer's general error channel rather than through the
///  result of a specific operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorReason {
    /// A protocol or logic fault, see [PeerError::InternalInconsistency]
    Internal,
    /// The host rejected this peer's versions after the session was established; the session
    ///  is terminated
    Incompatible,
    /// Transport problems and other failures that are not tied to a specific caller
    Other,
}

impl From<anyhow::Error> for ConnectionError {
    fn from(value: anyhow::Error) -> Self {
        ConnectionError::Transport(value.to_string())
    }
}
