//! Engine error taxonomy.
//!
//! Every fallible engine operation is all-or-nothing: when one of these is
//! returned, the owning change is still at its last committed state.
//! Orphaned annotations are deliberately *not* here — orphaning is a normal
//! displayed outcome, not a failure.

use std::time::Duration;

use thiserror::Error;

use crate::diff::MalformedDiffError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Diff input rejected at ingestion; the change keeps its prior revision.
    #[error(transparent)]
    MalformedDiff(#[from] MalformedDiffError),

    /// An action violated state-machine or reviewer policy; nothing changed.
    #[error("cannot {action}: {reason}")]
    PolicyViolation {
        action: &'static str,
        reason: String,
    },

    /// Re-anchoring exceeded its time bound. The change is left at its
    /// prior fully re-anchored state; the ingestion is retryable.
    #[error("re-anchoring timed out after {0:?}; change left at prior revision")]
    ReanchorTimeout(Duration),

    /// Unknown change, revision, annotation, or anchor target.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Storage collaborator failure.
    #[error("storage failure")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn policy(action: &'static str, reason: impl Into<String>) -> Self {
        EngineError::PolicyViolation { action, reason: reason.into() }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
