//! Integration tests for the review session engine over the SQLite store.
//!
//! Exercises the full ingestion flow: revision ingest, anchor relocation
//! and orphaning, the review state machine with required reviewers,
//! scoring (including anti-gaming rules), and the notification stream.

use std::sync::Arc;

use revline::host::{Reviewer, Role};
use revline::{Config, EngineError, Notification, ReviewEngine, Window};
use revline_core::db::SqliteStore;
use revline_core::store::ChangeStore;
use revline_core::types::{
    AnnotationKind, AnnotationStatus, ChangeState, OrphanReason, ScoreEventKind, Side, Verdict,
};
use tokio::sync::mpsc::UnboundedReceiver;

const REV1: &str = "\
--- a/src/calc.rs
+++ b/src/calc.rs
@@ -8,4 +8,4 @@
 fn total(x: u32) -> u32 {
-    x + 1
+    x + 2
     return x
 }
";

// Same function shifted down four lines; the commented line is untouched.
const REV2_SHIFTED: &str = "\
--- a/src/calc.rs
+++ b/src/calc.rs
@@ -12,4 +12,4 @@
 fn total(x: u32) -> u32 {
-    x + 2
+    x + 3
     return x
 }
";

// The commented line is deleted with nothing similar left anywhere.
const REV2_DELETED: &str = "\
--- a/src/calc.rs
+++ b/src/calc.rs
@@ -8,4 +8,3 @@
 fn total(x: u32) -> u32 {
-    x + 2
-    return x
+    x + 3
 }
";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn engine() -> (ReviewEngine, Arc<SqliteStore>, UnboundedReceiver<Notification>) {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.keep().join("engine.db");
    let store = Arc::new(SqliteStore::open(&path.to_string_lossy()).await.unwrap());
    let (engine, rx) = ReviewEngine::new(store.clone(), Config::default());
    (engine, store, rx)
}

fn reviewer(id: &str) -> Reviewer {
    Reviewer { id: id.to_owned(), role: Role::Reviewer }
}

#[tokio::test]
async fn annotation_relocates_across_revisions() {
    let (engine, _store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "shift the calc body", "alice", vec!["bob".to_owned()])
        .await
        .unwrap();

    engine.ingest_revision(&change.id, REV1).await.unwrap();
    let annotation = engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();

    let summary = engine.ingest_revision(&change.id, REV2_SHIFTED).await.unwrap();
    assert_eq!(summary.revision_idx, 1);
    assert_eq!(summary.relocated, 1);
    assert_eq!(summary.orphaned, 0);

    let ad = engine.annotated_diff(&change.id, 1).await.unwrap();
    assert_eq!(ad.annotations.len(), 1);
    assert_eq!(ad.annotations[0].id, annotation.id, "identity is stable");
    assert_eq!(ad.annotations[0].status, AnnotationStatus::Active);
    assert_eq!(ad.annotations[0].anchor.line, 14, "relocated to the shifted line");
}

#[tokio::test]
async fn deleted_line_orphans_then_reattaches() {
    let (engine, _store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "drop the bare return", "alice", vec![])
        .await
        .unwrap();

    engine.ingest_revision(&change.id, REV1).await.unwrap();
    let annotation = engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();

    let summary = engine.ingest_revision(&change.id, REV2_DELETED).await.unwrap();
    assert_eq!(summary.orphaned, 1);

    let ad = engine.annotated_diff(&change.id, 1).await.unwrap();
    assert_eq!(ad.annotations[0].status, AnnotationStatus::Orphaned);
    assert_eq!(
        ad.annotations[0].orphan_reason,
        Some(OrphanReason::ContentNotFound)
    );

    // Clearing the orphan is explicit and creates a new linked annotation.
    let replacement = engine
        .reattach_annotation(&change.id, &annotation.id, "src/calc.rs", Side::New, 9)
        .await
        .unwrap();
    assert_eq!(replacement.supersedes.as_deref(), Some(annotation.id.as_str()));
    assert_eq!(replacement.status, AnnotationStatus::Active);

    let ad = engine.annotated_diff(&change.id, 1).await.unwrap();
    assert_eq!(ad.annotations.len(), 2);
    let old = ad.annotations.iter().find(|a| a.id == annotation.id).unwrap();
    assert_eq!(old.status, AnnotationStatus::Orphaned, "old row never moves back");
}

#[tokio::test]
async fn first_comment_scores_and_self_review_does_not() {
    let (engine, store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "scoring check", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();

    // Reviewer A's first substantive comment: exactly one +2 event.
    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();
    let events = store.score_events_for("bob", None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ScoreEventKind::FirstComment);
    assert_eq!(events[0].points, 2);
    assert_eq!(engine.reviewer_total("bob", Window::AllTime).await.unwrap(), 2);

    // A second, different comment is not a first comment.
    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            8,
            AnnotationKind::Comment,
            "consider a checked_add for the overflow path",
            None,
        )
        .await
        .unwrap();
    assert_eq!(engine.reviewer_total("bob", Window::AllTime).await.unwrap(), 2);

    // The author commenting on their own change scores nothing, ever.
    engine
        .add_annotation(
            &change.id,
            "alice",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "will fold this into the next revision",
            None,
        )
        .await
        .unwrap();
    assert!(store.score_events_for("alice", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn rapid_fire_duplicates_collapse_to_one_event() {
    let (engine, store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "duplicate check", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();

    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();
    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            8,
            AnnotationKind::Comment,
            "bare return reads oddly here!",
            None,
        )
        .await
        .unwrap();

    let events = store.score_events_for("bob", None).await.unwrap();
    assert_eq!(events.len(), 1, "near-identical rapid-fire comment collapsed");
}

#[tokio::test]
async fn two_required_reviewers_split_verdict_flow() {
    let (engine, store, _rx) = engine().await;
    let change = engine
        .create_change(
            "main..topic",
            "needs both reviewers",
            "alice",
            vec!["bob".to_owned(), "carol".to_owned()],
        )
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();

    // One approves, one requests changes: ChangesRequested, not Approved.
    let state = engine
        .record_verdict(&change.id, "bob", Verdict::Approve)
        .await
        .unwrap();
    assert_eq!(state, ChangeState::UnderReview, "one of two approvals");
    let state = engine
        .record_verdict(&change.id, "carol", Verdict::RequestChanges)
        .await
        .unwrap();
    assert_eq!(state, ChangeState::ChangesRequested);

    // Merging now is a policy violation and changes nothing.
    let err = engine
        .merge_change(&change.id, &reviewer("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));
    assert_eq!(
        engine.change_state(&change.id).await.unwrap(),
        ChangeState::ChangesRequested
    );

    // A new revision resets to UnderReview; standing verdicts go stale.
    let summary = engine.ingest_revision(&change.id, REV2_SHIFTED).await.unwrap();
    assert_eq!(summary.state, ChangeState::UnderReview);

    // Bob's old approval is stale: one fresh approval is not enough.
    let state = engine
        .record_verdict(&change.id, "carol", Verdict::Approve)
        .await
        .unwrap();
    assert_eq!(state, ChangeState::UnderReview, "bob must re-affirm");

    let state = engine
        .record_verdict(&change.id, "bob", Verdict::Approve)
        .await
        .unwrap();
    assert_eq!(state, ChangeState::Approved);

    engine.merge_change(&change.id, &reviewer("alice")).await.unwrap();
    assert_eq!(engine.change_state(&change.id).await.unwrap(), ChangeState::Merged);

    // Both approvers hold an approval event (+3); re-affirming the
    // follow-up revision quickly also earned each a fast-response bonus.
    for who in ["bob", "carol"] {
        let events = store.score_events_for(who, None).await.unwrap();
        let approvals: Vec<_> = events
            .iter()
            .filter(|e| e.kind == ScoreEventKind::Approval)
            .collect();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].points, 3);
        assert!(events
            .iter()
            .any(|e| e.kind == ScoreEventKind::FastResponse));
    }
    // The author earns nothing from the merge.
    assert!(store.score_events_for("alice", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_diff_is_rejected_without_side_effects() {
    let (engine, _store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "bad input", "alice", vec![])
        .await
        .unwrap();

    let err = engine
        .ingest_revision(&change.id, "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MalformedDiff(_)));

    // Nothing was committed: still Open, no revision 0.
    assert_eq!(engine.change_state(&change.id).await.unwrap(), ChangeState::Open);
    let err = engine.annotated_diff(&change.id, 0).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn policy_violations_leave_state_unchanged() {
    let (engine, _store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "policy checks", "alice", vec!["bob".to_owned()])
        .await
        .unwrap();

    // No revision yet: annotating and reviewing are premature.
    let err = engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "too early for this one",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));

    engine.ingest_revision(&change.id, REV1).await.unwrap();

    // Authors cannot review their own change.
    let err = engine
        .record_verdict(&change.id, "alice", Verdict::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));

    // Only the author or an admin may close.
    let err = engine.close_change(&change.id, &reviewer("bob")).await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));
    engine
        .close_change(&change.id, &Reviewer { id: "ops".to_owned(), role: Role::Admin })
        .await
        .unwrap();
    assert_eq!(engine.change_state(&change.id).await.unwrap(), ChangeState::Closed);

    // Terminal states accept no further mutations.
    let err = engine.ingest_revision(&change.id, REV2_SHIFTED).await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));
    let err = engine
        .record_verdict(&change.id, "bob", Verdict::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));
}

#[tokio::test]
async fn suggestion_acceptance_scores_its_author() {
    let (engine, store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "suggestion flow", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();

    let suggestion = engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            9,
            AnnotationKind::Suggestion,
            "saturating_add keeps the overflow contract",
            Some("    x.saturating_add(2)".to_owned()),
        )
        .await
        .unwrap();

    // Only the author may accept.
    let err = engine
        .accept_suggestion(&change.id, &suggestion.id, "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation { .. }));

    engine
        .accept_suggestion(&change.id, &suggestion.id, "alice")
        .await
        .unwrap();

    let ad = engine.annotated_diff(&change.id, 0).await.unwrap();
    let accepted = ad.annotations.iter().find(|a| a.id == suggestion.id).unwrap();
    assert_eq!(accepted.status, AnnotationStatus::Resolved);

    let events = store.score_events_for("bob", None).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == ScoreEventKind::SuggestionAccepted && e.points == 5));
}

#[tokio::test]
async fn reversal_restores_the_leaderboard_total() {
    let (engine, store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "reversal flow", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();
    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();

    let before = engine.reviewer_total("bob", Window::AllTime).await.unwrap();
    assert_eq!(before, 2);

    let events = store.score_events_for("bob", None).await.unwrap();
    let reversal = engine.reverse_event(&events[0]).await.unwrap();
    assert_eq!(reversal.points, -2);
    assert_eq!(reversal.reverses.as_deref(), Some(events[0].id.as_str()));

    assert_eq!(engine.reviewer_total("bob", Window::AllTime).await.unwrap(), 0);
    let after = store.score_events_for("bob", None).await.unwrap();
    assert_eq!(after.len(), 2, "the original event is never deleted");
}

#[tokio::test]
async fn replies_thread_and_leaderboard_ranks() {
    let (engine, _store, _rx) = engine().await;
    let change = engine
        .create_change("main..topic", "threads and ranks", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();

    let annotation = engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();
    engine
        .add_reply(&change.id, &annotation.id, "alice", "fair, rewriting it")
        .await
        .unwrap();
    engine
        .add_annotation(
            &change.id,
            "carol",
            "src/calc.rs",
            Side::New,
            8,
            AnnotationKind::Comment,
            "signature wants a doc comment",
            None,
        )
        .await
        .unwrap();

    let ad = engine.annotated_diff(&change.id, 0).await.unwrap();
    let threaded = ad.annotations.iter().find(|a| a.id == annotation.id).unwrap();
    assert_eq!(threaded.replies.len(), 1);
    assert_eq!(threaded.replies[0].body, "fair, rewriting it");

    let board = engine.leaderboard(Window::Weekly, 10).await.unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].total, 2);
    assert_eq!(board[1].total, 2);
}

#[tokio::test]
async fn notifications_flow_best_effort() {
    let (engine, _store, mut rx) = engine().await;
    let change = engine
        .create_change("main..topic", "notification check", "alice", vec![])
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV1).await.unwrap();
    engine
        .add_annotation(
            &change.id,
            "bob",
            "src/calc.rs",
            Side::New,
            10,
            AnnotationKind::Comment,
            "bare return reads oddly here",
            None,
        )
        .await
        .unwrap();
    engine.ingest_revision(&change.id, REV2_DELETED).await.unwrap();

    let mut saw_added = false;
    let mut saw_status = false;
    let mut saw_orphaned = false;
    let mut saw_score = false;
    while let Ok(n) = rx.try_recv() {
        match n {
            Notification::AnnotationAdded { .. } => saw_added = true,
            Notification::StatusChanged { .. } => saw_status = true,
            Notification::AnnotationOrphaned { reason, .. } => {
                assert_eq!(reason, OrphanReason::ContentNotFound);
                saw_orphaned = true;
            }
            Notification::ScoreChanged { delta, .. } => {
                assert_eq!(delta, 2);
                saw_score = true;
            }
            _ => {}
        }
    }
    assert!(saw_added && saw_status && saw_orphaned && saw_score);
}
