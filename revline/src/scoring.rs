//! Review-activity scoring under anti-gaming rules.
//!
//! `on_activity` converts one piece of reviewer activity into zero or more
//! [`ScoreEvent`]s. It is pure given its inputs: the engine gathers the
//! facts the rules need into an [`ActivityContext`] and appends the
//! resulting events in the same transaction as the triggering mutation.
//!
//! Every constant here is deployment configuration, not law — the defaults
//! mirror the product rules (first substantive comment +2, accepted
//! suggestion +5, approval of a merged change +3) but ship in the config
//! file. Self-review scores zero unconditionally, and rapid-fire
//! near-duplicate comments collapse to a single event.
//!
//! Leaderboard totals are a fold over the append-only event log, filtered
//! by time window. Corrections are additive reversal events; nothing is
//! ever recomputed destructively.

use serde::Deserialize;
use similar::TextDiff;
use tracing::debug;
use uuid::Uuid;

use revline_core::types::{ScoreEvent, ScoreEventKind};

/// Point values and anti-gaming thresholds. All tunable per deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Points for a reviewer's first substantive comment on a change.
    pub first_comment: i64,
    /// Points when the change author accepts a suggestion.
    pub suggestion_accepted: i64,
    /// Points per fresh approver when the change is merged.
    pub approval_merged: i64,
    /// Bonus for reacting to a follow-up revision quickly.
    pub fast_response: i64,
    /// Window after a follow-up revision arrives in which a reaction counts
    /// as fast.
    pub fast_response_secs: i64,
    /// Comments by the same reviewer on the same change within this window
    /// are checked for near-duplication.
    pub duplicate_window_secs: i64,
    /// Word-level similarity at or above which two bodies are considered
    /// the same comment.
    pub duplicate_similarity: f64,
    /// Minimum trimmed body length for a comment to be substantive.
    pub min_substantive_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            first_comment: 2,
            suggestion_accepted: 5,
            approval_merged: 3,
            fast_response: 1,
            fast_response_secs: 3_600,
            duplicate_window_secs: 120,
            duplicate_similarity: 0.9,
            min_substantive_len: 8,
        }
    }
}

/// One piece of raw reviewer activity, as observed by the engine.
#[derive(Debug, Clone)]
pub enum Activity {
    CommentPosted {
        change_id: String,
        change_author: String,
        reviewer: String,
        body: String,
        revision_idx: u32,
        revision_at: i64,
    },
    VerdictRecorded {
        change_id: String,
        change_author: String,
        reviewer: String,
        revision_idx: u32,
        revision_at: i64,
    },
    SuggestionAccepted {
        change_id: String,
        change_author: String,
        suggestion_author: String,
    },
    ChangeMerged {
        change_id: String,
        change_author: String,
        /// Reviewers holding a fresh approval at merge time.
        approvers: Vec<String>,
    },
}

/// Facts about prior activity that the rules consult, gathered by the
/// engine from the change snapshot and the score log.
#[derive(Debug, Clone, Default)]
pub struct ActivityContext {
    /// Substantive comments this reviewer already made on this change.
    pub prior_substantive_comments: usize,
    /// (timestamp, body) of this reviewer's recent comments on this change.
    pub recent_comment_bodies: Vec<(i64, String)>,
    /// Whether a fast-response event was already recorded for this
    /// (reviewer, revision).
    pub fast_response_already_scored: bool,
}

fn event(
    reviewer: &str,
    change_id: &str,
    kind: ScoreEventKind,
    points: i64,
    now: i64,
) -> ScoreEvent {
    ScoreEvent {
        id: Uuid::new_v4().to_string(),
        reviewer_id: reviewer.to_owned(),
        change_id: change_id.to_owned(),
        kind,
        points,
        reverses: None,
        created_at: now,
    }
}

/// Word-level similarity of two comment bodies, 0..1.
fn body_similarity(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_words(a, b).ratio())
}

/// True when the reaction qualifies for the fast-response bonus: a
/// follow-up revision (index >= 1) answered within the configured window,
/// not yet scored for this (reviewer, revision).
fn is_fast_response(
    cfg: &ScoringConfig,
    ctx: &ActivityContext,
    revision_idx: u32,
    revision_at: i64,
    now: i64,
) -> bool {
    revision_idx >= 1
        && now.saturating_sub(revision_at) <= cfg.fast_response_secs
        && !ctx.fast_response_already_scored
}

/// Converts one activity into zero or more score events.
///
/// Self-review (actor == change author) yields nothing, always. Returns an
/// empty vec rather than failing for every non-qualifying case — scoring
/// never blocks the triggering action.
pub fn on_activity(
    cfg: &ScoringConfig,
    activity: &Activity,
    ctx: &ActivityContext,
    now: i64,
) -> Vec<ScoreEvent> {
    match activity {
        Activity::CommentPosted {
            change_id,
            change_author,
            reviewer,
            body,
            revision_idx,
            revision_at,
        } => {
            if reviewer == change_author {
                debug!(change_id, reviewer, "self-review comment, no score");
                return Vec::new();
            }
            if body.trim().len() < cfg.min_substantive_len {
                return Vec::new();
            }
            let duplicate = ctx.recent_comment_bodies.iter().any(|(ts, prior)| {
                now.saturating_sub(*ts) <= cfg.duplicate_window_secs
                    && body_similarity(prior, body) >= cfg.duplicate_similarity
            });
            if duplicate {
                debug!(change_id, reviewer, "rapid-fire duplicate comment collapsed");
                return Vec::new();
            }
            let mut events = Vec::new();
            if ctx.prior_substantive_comments == 0 {
                events.push(event(
                    reviewer,
                    change_id,
                    ScoreEventKind::FirstComment,
                    cfg.first_comment,
                    now,
                ));
            }
            if is_fast_response(cfg, ctx, *revision_idx, *revision_at, now) {
                events.push(event(
                    reviewer,
                    change_id,
                    ScoreEventKind::FastResponse,
                    cfg.fast_response,
                    now,
                ));
            }
            events
        }
        Activity::VerdictRecorded {
            change_id,
            change_author,
            reviewer,
            revision_idx,
            revision_at,
        } => {
            if reviewer == change_author {
                return Vec::new();
            }
            if is_fast_response(cfg, ctx, *revision_idx, *revision_at, now) {
                vec![event(
                    reviewer,
                    change_id,
                    ScoreEventKind::FastResponse,
                    cfg.fast_response,
                    now,
                )]
            } else {
                Vec::new()
            }
        }
        Activity::SuggestionAccepted {
            change_id,
            change_author,
            suggestion_author,
        } => {
            if suggestion_author == change_author {
                debug!(change_id, "self-suggestion accepted, no score");
                return Vec::new();
            }
            vec![event(
                suggestion_author,
                change_id,
                ScoreEventKind::SuggestionAccepted,
                cfg.suggestion_accepted,
                now,
            )]
        }
        Activity::ChangeMerged {
            change_id,
            change_author,
            approvers,
        } => approvers
            .iter()
            .filter(|a| *a != change_author)
            .map(|a| {
                event(
                    a,
                    change_id,
                    ScoreEventKind::Approval,
                    cfg.approval_merged,
                    now,
                )
            })
            .collect(),
    }
}

/// Builds the additive counter event that undoes `original`.
///
/// The original row is untouched; the correction carries the negated
/// points and a `reverses` link for the audit trail.
pub fn reversal_of(original: &ScoreEvent, now: i64) -> ScoreEvent {
    ScoreEvent {
        id: Uuid::new_v4().to_string(),
        reviewer_id: original.reviewer_id.clone(),
        change_id: original.change_id.clone(),
        kind: ScoreEventKind::Reversal,
        points: -original.points,
        reverses: Some(original.id.clone()),
        created_at: now,
    }
}

/// Leaderboard time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    AllTime,
    Weekly,
    Daily,
}

impl Window {
    /// Lower bound on `created_at` for this window, or `None` for all-time.
    pub fn since(self, now: i64) -> Option<i64> {
        match self {
            Window::AllTime => None,
            Window::Weekly => Some(now - 7 * 86_400),
            Window::Daily => Some(now - 86_400),
        }
    }
}

/// Pure fold of a reviewer's events into a point total, window-filtered.
pub fn fold_total(events: &[ScoreEvent], since: Option<i64>) -> i64 {
    events
        .iter()
        .filter(|e| since.map_or(true, |s| e.created_at >= s))
        .map(|e| e.points)
        .sum()
}
