//! Typed error hierarchy for the orchestrator core.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence and state-transition failures
//! - `GitHostError` — bare-repo hosting and transport failures
//! - `DispatchError` — queue/runner matching failures
//!
//! Merge and rebase conflicts are deliberately *not* errors; they are
//! structured results (`MergeOutcome::Conflict`) so callers can route on
//! them without unwinding.

use thiserror::Error;

/// Errors from the persistence layer and transactional transitions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("illegal {entity} transition from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// A conditional state write found the row in a different state than
    /// expected. Retryable by the caller.
    #[error("{entity} {id} changed concurrently; transition lost")]
    TransitionLost { entity: &'static str, id: i64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("database lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Stable kind code surfaced to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TransitionLost { .. } => "transition_lost",
            Self::Validation(_) => "validation",
            Self::Database(_) | Self::LockPoisoned => "internal",
        }
    }
}

/// Errors from the internal git server.
#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("repo {0} has not been ingested")]
    NotIngested(i64),

    #[error("invalid ref '{0}'")]
    InvalidRef(String),

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("git transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitHostError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotIngested(_) => "not_ingested",
            Self::InvalidRef(_) | Self::BranchNotFound(_) => "invalid_ref",
            Self::Transport(_) => "git_transport",
            Self::Git(_) | Self::Io { .. } => "git_internal",
        }
    }
}

/// Errors from job dispatch and the runner pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no connected runner of type '{0}'")]
    NoRunner(String),

    #[error("job {0} was claimed by another dispatcher")]
    ClaimLost(i64),

    #[error("runner {0} did not acknowledge the assignment in time")]
    AckTimeout(i64),

    #[error("continuation runner unavailable")]
    ContinuationUnavailable,

    #[error("runner {0} is already connected")]
    AlreadyConnected(i64),

    #[error("unknown runner type '{0}'")]
    UnknownRunnerType(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRunner(_) => "no_runner",
            Self::ClaimLost(_) => "claim_lost",
            Self::AckTimeout(_) => "ack_timeout",
            Self::ContinuationUnavailable => "continuation_unavailable",
            Self::AlreadyConnected(_) => "already_connected",
            Self::UnknownRunnerType(_) => "unknown_runner_type",
        }
    }
}
