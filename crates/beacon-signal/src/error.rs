//! Error types for the signaling broker
//!
//! Nothing here is fatal to the process; each variant maps to an `error`
//! message sent back over the originating connection.

use thiserror::Error;

/// Signaling-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("remoteId is required")]
    MissingRemoteId,

    #[error("sessionId is required")]
    MissingSessionId,

    #[error("server not found")]
    ServerNotFound,

    #[error("session not found")]
    SessionNotFound,

    #[error("client not found")]
    ClientNotFound,

    #[error("server disconnected")]
    ServerDisconnected,

    #[error("not a server")]
    NotAServer,

    #[error("not registered")]
    NotRegistered,

    #[error("unexpected message type")]
    UnexpectedMessage,

    #[error("rate limited, retry in {0}s")]
    RateLimited(u64),
}
