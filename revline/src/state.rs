//! Review lifecycle state transitions.
//!
//! States: `Open -> UnderReview -> ChangesRequested/Approved -> Merged`,
//! with `Closed` reachable from every non-terminal state. The functions
//! here are pure: the engine loads the full session set for a change,
//! applies one of these, and commits the result atomically. Entering
//! `UnderReview` or `Approved` always re-derives from *all* sessions, never
//! just the triggering one.

use revline_core::types::{ChangeState, ReviewSession, Verdict};

/// Re-derives the review-phase state from the complete session set.
///
/// - Any `request-changes` verdict on the latest revision wins:
///   `ChangesRequested`.
/// - Otherwise `Approved` when every required reviewer holds `approve` on
///   the latest revision. With no required reviewers configured, any fresh
///   approval suffices.
/// - Otherwise `UnderReview`.
///
/// Stale verdicts (recorded against an older revision) never count toward
/// approval and never block it — their holders must re-affirm.
pub fn derive_review_state(
    sessions: &[ReviewSession],
    required: &[String],
    latest_revision: u32,
) -> ChangeState {
    let fresh = |s: &&ReviewSession| !s.is_stale(latest_revision);

    if sessions
        .iter()
        .filter(fresh)
        .any(|s| s.verdict == Verdict::RequestChanges)
    {
        return ChangeState::ChangesRequested;
    }

    let approved = if required.is_empty() {
        sessions
            .iter()
            .filter(fresh)
            .any(|s| s.verdict == Verdict::Approve)
    } else {
        required.iter().all(|r| {
            sessions.iter().any(|s| {
                s.reviewer_id == *r
                    && s.verdict == Verdict::Approve
                    && !s.is_stale(latest_revision)
            })
        })
    };

    if approved {
        ChangeState::Approved
    } else {
        ChangeState::UnderReview
    }
}

/// State after a verdict lands. The caller has already rejected terminal
/// states and author self-verdicts; `sessions` includes the new verdict.
pub fn after_verdict(
    sessions: &[ReviewSession],
    required: &[String],
    latest_revision: u32,
) -> ChangeState {
    derive_review_state(sessions, required, latest_revision)
}

/// State after the first (or any) annotation: an `Open` change moves under
/// review; every other non-terminal state is unaffected.
pub fn after_annotation(current: ChangeState) -> ChangeState {
    if current == ChangeState::Open {
        ChangeState::UnderReview
    } else {
        current
    }
}

/// State after a new revision is ingested.
///
/// Standing verdicts become stale, so `ChangesRequested` and `Approved`
/// both fall back to `UnderReview` until reviewers re-affirm. An `Open`
/// change (no review activity yet) stays `Open`.
pub fn after_new_revision(current: ChangeState) -> ChangeState {
    match current {
        ChangeState::Open => ChangeState::Open,
        ChangeState::UnderReview
        | ChangeState::ChangesRequested
        | ChangeState::Approved => ChangeState::UnderReview,
        terminal => terminal,
    }
}
