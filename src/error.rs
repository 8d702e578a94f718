//! Crate-level error types for event log access, command execution,
//! state retrieval, and routing.

use std::time::Duration;

use crate::log::Epoch;

/// Error returned by an [`EventLog`](crate::EventLog) backend.
///
/// A failed `append` never leaves a partial record behind, so every variant
/// means "nothing was persisted".
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event or record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The writer's fencing token is older than the newest one the log has
    /// accepted. The writer lost leadership and must stop writing.
    #[error("stale epoch {attempted}: log is fenced at {current}")]
    StaleEpoch {
        /// Epoch carried by the rejected append.
        attempted: Epoch,
        /// Epoch the log is currently fenced at.
        current: Epoch,
    },

    /// The stream identifier cannot be used as a storage key.
    #[error("invalid stream id: {0:?}")]
    InvalidStreamId(String),
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g. "todo does not exist").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic. No event was written.
    #[error(transparent)]
    Domain(E),

    /// The event log refused or failed the append. No event was written
    /// and the in-memory state is unchanged.
    #[error("event log failure: {0}")]
    Log(#[from] LogError),

    /// The actor had already stopped; the command was never delivered.
    #[error("aggregate actor is no longer running")]
    ActorGone,

    /// The actor accepted the command but stopped before replying.
    /// The command may or may not have been persisted.
    #[error("aggregate actor stopped before replying")]
    ReplyLost,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Replaying the event stream failed.
    #[error("event log failure: {0}")]
    Log(#[from] LogError),

    /// The actor had already stopped; the query was never delivered.
    #[error("aggregate actor is no longer running")]
    ActorGone,

    /// The actor accepted the query but stopped before replying.
    #[error("aggregate actor stopped before replying")]
    ReplyLost,
}

/// Error returned by a [`Route`](crate::Route) when a command could not be
/// turned into a [`Reply`](crate::Reply).
///
/// Every variant is a server-side failure from the caller's point of view.
/// The command may still have been persisted (at-least-once delivery).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The caller's deadline elapsed. The command keeps running.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// This node does not host the active supervisor.
    #[error("supervisor is not active on this node")]
    NotActive,

    /// No active supervisor became known within the handover window.
    #[error("no active supervisor within {0:?}")]
    NoLeader(Duration),

    /// The event could not be made durable.
    #[error("persistence failure: {0}")]
    Persistence(#[from] LogError),

    /// The worker or routing path failed for another reason.
    #[error("routing failure: {0}")]
    Unavailable(String),
}
