//! Storage abstraction for the review session engine.
//!
//! The [`ChangeStore`] trait defines every persistence operation the engine
//! needs, keeping the SQLite implementation (and any future backend) behind
//! a narrow seam. Each mutating method is one atomic unit: the backend must
//! commit everything the call carries or nothing — the engine relies on this
//! for its all-or-nothing-per-operation guarantee.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    Annotation, AnnotationStatus, Change, ChangeState, OrphanReason, Reply, ReviewSession,
    ScoreEvent,
};

/// Everything the engine needs to know about a change before mutating it.
///
/// Loaded in one consistent read; the engine holds the per-change lock while
/// acting on it, so the snapshot cannot go stale mid-operation.
#[derive(Debug, Clone)]
pub struct ChangeSnapshot {
    pub change: Change,
    pub required_reviewers: Vec<String>,
    /// Number of revisions ingested so far; the latest index is `count - 1`.
    pub revision_count: u32,
    /// `created_at` of the newest revision, if any.
    pub latest_revision_at: Option<i64>,
    pub sessions: Vec<ReviewSession>,
    pub annotations: Vec<Annotation>,
}

/// A change row to be created, with its required-reviewer set.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub id: String,
    pub change_ref: String,
    pub title: String,
    pub author_id: String,
    pub required_reviewers: Vec<String>,
    pub created_at: i64,
}

/// One annotation's new position/status after a re-anchor pass.
///
/// `line` is the relocated line number for located annotations, or the last
/// known line unchanged for orphans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationUpdate {
    pub id: String,
    pub status: AnnotationStatus,
    pub orphan_reason: Option<OrphanReason>,
    pub line: u32,
}

/// One leaderboard row: a reviewer and their folded point total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub reviewer_id: String,
    pub total: i64,
}

/// Abstract storage backend for changes, annotations, sessions, and the
/// score-event log.
///
/// Mutating methods take every record the operation touches and commit them
/// in a single transaction. Read methods never block behind engine locks;
/// they observe the latest committed state.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Insert a new change with its required-reviewer set. State starts `Open`.
    async fn create_change(&self, change: &NewChange) -> Result<()>;

    /// Load the full working set for a change, or `None` if the id is unknown.
    async fn load_change(&self, change_id: &str) -> Result<Option<ChangeSnapshot>>;

    /// Load the raw unified diff of one revision, or `None` if absent.
    async fn load_revision(&self, change_id: &str, idx: u32) -> Result<Option<String>>;

    /// Commit a new revision together with the re-anchor outcome and the
    /// resulting change state. Atomic: either the revision row, every
    /// annotation update, and the state land, or none do.
    async fn commit_revision(
        &self,
        change_id: &str,
        idx: u32,
        raw_diff: &str,
        created_at: i64,
        updates: &[AnnotationUpdate],
        state: ChangeState,
    ) -> Result<()>;

    /// Insert an annotation plus any score events it earned, and the
    /// (possibly unchanged) change state, atomically.
    async fn commit_annotation(
        &self,
        change_id: &str,
        annotation: &Annotation,
        state: ChangeState,
        events: &[ScoreEvent],
    ) -> Result<()>;

    /// Insert a reply under an existing annotation.
    async fn commit_reply(&self, change_id: &str, reply: &Reply) -> Result<()>;

    /// Apply a status update (resolve / orphan-clear bookkeeping) to one
    /// annotation, plus any score events, atomically.
    async fn commit_annotation_status(
        &self,
        change_id: &str,
        update: &AnnotationUpdate,
        resolved_at: Option<i64>,
        events: &[ScoreEvent],
    ) -> Result<()>;

    /// Upsert a reviewer's session row and the re-derived change state,
    /// plus any score events, atomically.
    async fn commit_verdict(
        &self,
        change_id: &str,
        session: &ReviewSession,
        state: ChangeState,
        events: &[ScoreEvent],
    ) -> Result<()>;

    /// Move a change to `state` (merge/close), plus any score events.
    async fn commit_state(
        &self,
        change_id: &str,
        state: ChangeState,
        updated_at: i64,
        events: &[ScoreEvent],
    ) -> Result<()>;

    /// Append score events outside any change mutation (corrections).
    async fn append_score_events(&self, events: &[ScoreEvent]) -> Result<()>;

    /// All score events for one reviewer, oldest first, optionally bounded
    /// to `created_at >= since`.
    async fn score_events_for(
        &self,
        reviewer_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ScoreEvent>>;

    /// Folded totals per reviewer, highest first, optionally bounded to
    /// `created_at >= since`. Ties are ordered by reviewer id for stability.
    async fn leaderboard(&self, since: Option<i64>, limit: u32) -> Result<Vec<LeaderboardEntry>>;
}
