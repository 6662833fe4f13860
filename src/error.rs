//! Error taxonomy for the engine.
//!
//! Duplicate submissions and below-threshold metrics are not errors here:
//! they are ordinary values (`AppendOutcome::Duplicate`,
//! `MetricValue::InsufficientData`) so callers cannot mistake them for
//! failures.

use crate::plan::Level;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Schema or required-field violation. Rejected before persistence.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Milestone evidence for a level the goal has not reached yet.
    #[error(
        "milestone '{milestone_id}' belongs to level {milestone_level} but the goal is at {current_level}"
    )]
    OutOfOrderEvidence {
        milestone_id: String,
        milestone_level: Level,
        current_level: Level,
    },

    #[error("unknown subject: {0}")]
    UnknownSubject(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Background recomputation gave up after its retries. Never returned to
    /// an ingestion caller.
    #[error("recomputation failed for subject {subject_id}: {reason}")]
    RecomputationFailure { subject_id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// Short machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::OutOfOrderEvidence { .. } => "out_of_order_evidence",
            Self::UnknownSubject(_) => "unknown_subject",
            Self::NotFound(_) => "not_found",
            Self::RecomputationFailure { .. } => "recomputation_failure",
            Self::Database(_) => "database",
            Self::Other(_) => "internal",
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Other(_) | Self::RecomputationFailure { .. }
        )
    }
}
