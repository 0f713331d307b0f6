//! Error Types
//!
//! Error taxonomy for the mesh protocol core and the radio transport seam.

use thiserror::Error;

use crate::bluetooth::peer_registry::ConnectionState;
use crate::bluetooth::mesh_session::SessionState;
use crate::bluetooth::transport::ConnectionHandle;
use crate::message::MessageKind;

/// Result alias used throughout the mesh core
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors surfaced by the mesh session, codec and registry
#[derive(Debug, Error)]
pub enum MeshError {
    /// Radio absent or disabled. Fatal to `start`, never retried automatically.
    #[error("bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The transport did not confirm an operation in time. Safe to retry.
    #[error("transport did not confirm {operation} within {timeout_ms} ms")]
    TransportTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("malformed mesh frame: {0}")]
    MalformedMessage(String),

    #[error("no connected peer can receive this message")]
    NotConnected,

    /// Registry state-machine anomaly; corrected and logged, never returned to callers.
    #[error("invalid connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("mesh session is not active (state: {0:?})")]
    NotActive(SessionState),

    #[error("mesh session already started (state: {0:?})")]
    AlreadyStarted(SessionState),

    #[error("{0:?} messages are broadcast to every connected peer and cannot be unicast")]
    BroadcastOnly(MessageKind),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("mesh session task has shut down")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`Transport`](crate::bluetooth::Transport) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("radio unavailable: {0}")]
    Unavailable(String),

    #[error("unknown peer address {0}")]
    UnknownPeer(String),

    #[error("connection {0:?} is closed")]
    ConnectionClosed(ConnectionHandle),

    #[error("transport backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        TransportError::Backend(format!("{err:#}"))
    }
}
