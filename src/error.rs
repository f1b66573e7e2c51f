//! Typed errors for the workout engine and the replication layer.
//!
//! Storage failures stay as `anyhow::Error` with context, the same way the
//! database layer reports them.

/// Rejections raised while validating a program or expanding it into segments.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid program: {reason}")]
    InvalidProgram { reason: String },

    #[error("plan would need {count} segments, limit is {limit}")]
    TooManySegments { count: u64, limit: u64 },
}

impl PlanError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        PlanError::InvalidProgram {
            reason: reason.into(),
        }
    }
}

/// Failures of a single transport primitive. Never fatal to a local write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer is not reachable")]
    Unreachable,

    #[error("link session is not activated")]
    NotActivated,

    #[error("peer did not reply in time")]
    Timeout,

    #[error("link dropped before the peer replied")]
    Disconnected,

    #[error("peer rejected the message: {0}")]
    Rejected(String),
}

/// Reasons an inbound envelope is dropped without touching local state.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("checksum mismatch (expected {expected}, computed {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("payload is not valid: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("payload carries an invalid entity: {0}")]
    InvalidEntity(String),

    #[error("action is not accepted on this channel")]
    UnexpectedAction,
}

/// Workout controller command rejections.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkoutError {
    #[error("a workout is already active")]
    AlreadyActive,

    #[error("no active workout")]
    NotActive,

    #[error("workout is not paused")]
    NotPaused,

    #[error("workout is already paused")]
    AlreadyPaused,

    #[error(transparent)]
    Plan(#[from] PlanError),
}
