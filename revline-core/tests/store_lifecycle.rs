//! Integration test for the SQLite store lifecycle.
//!
//! Exercises: open_db, migrate, create_change, load_change, commit_revision,
//! commit_annotation, commit_reply, commit_verdict, commit_state,
//! append_score_events, score_events_for, leaderboard.

use revline_core::db::{open_db, SqliteStore};
use revline_core::store::{AnnotationUpdate, ChangeStore, NewChange};
use revline_core::types::{
    Anchor, Annotation, AnnotationKind, AnnotationStatus, ChangeState, OrphanReason, Reply,
    ReviewSession, ScoreEvent, ScoreEventKind, Side, Verdict,
};

fn temp_db_path() -> String {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.keep().join("test.db");
    path.to_string_lossy().to_string()
}

fn new_change(id: &str, author: &str, reviewers: &[&str]) -> NewChange {
    NewChange {
        id: id.to_owned(),
        change_ref: "main..topic".to_owned(),
        title: "Tighten input validation".to_owned(),
        author_id: author.to_owned(),
        required_reviewers: reviewers.iter().map(|r| (*r).to_owned()).collect(),
        created_at: 1_000,
    }
}

fn annotation(id: &str, change_id: &str, author: &str, line: u32) -> Annotation {
    Annotation {
        id: id.to_owned(),
        change_id: change_id.to_owned(),
        author_id: author.to_owned(),
        kind: AnnotationKind::Comment,
        status: AnnotationStatus::Active,
        body: "this clamp silently drops negative values".to_owned(),
        patch: None,
        anchor: Anchor {
            path: "src/input.rs".to_owned(),
            side: Side::New,
            line_hash: "aa".repeat(32),
            context: vec!["bb".repeat(32), "cc".repeat(32)],
            line,
        },
        created_revision: 0,
        orphan_reason: None,
        supersedes: None,
        created_at: 1_100,
        resolved_at: None,
        replies: Vec::new(),
    }
}

fn score_event(id: &str, reviewer: &str, change: &str, kind: ScoreEventKind, points: i64) -> ScoreEvent {
    ScoreEvent {
        id: id.to_owned(),
        reviewer_id: reviewer.to_owned(),
        change_id: change.to_owned(),
        kind,
        points,
        reverses: None,
        created_at: 1_100,
    }
}

#[tokio::test]
async fn full_store_lifecycle() {
    let path = temp_db_path();
    let conn = open_db(&path).await.unwrap();

    // Verify schema_version = 1
    let version: i64 = conn
        .call(|db| {
            Ok::<_, rusqlite::Error>(db.query_row(
                "SELECT MAX(version) FROM schema_version",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(version, 1, "schema_version should be 1");

    // Verify WAL mode
    let journal: String = conn
        .call(|db| {
            Ok::<_, rusqlite::Error>(
                db.query_row("PRAGMA journal_mode", [], |r| r.get(0))?,
            )
        })
        .await
        .unwrap();
    assert_eq!(journal, "wal", "journal_mode should be wal");

    let store = SqliteStore::from_connection(conn);

    // Unknown ids load as None
    assert!(store.load_change("missing").await.unwrap().is_none());
    assert!(store.load_revision("missing", 0).await.unwrap().is_none());

    // Create a change with two required reviewers
    store
        .create_change(&new_change("c1", "alice", &["bob", "carol"]))
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.change.state, ChangeState::Open);
    assert_eq!(snap.change.author_id, "alice");
    assert_eq!(snap.required_reviewers, vec!["bob", "carol"]);
    assert_eq!(snap.revision_count, 0);
    assert!(snap.latest_revision_at.is_none());

    // First revision
    store
        .commit_revision("c1", 0, "@@ -1 +1 @@\n-a\n+b\n", 1_050, &[], ChangeState::Open)
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.revision_count, 1);
    assert_eq!(snap.latest_revision_at, Some(1_050));
    assert_eq!(
        store.load_revision("c1", 0).await.unwrap().unwrap(),
        "@@ -1 +1 @@\n-a\n+b\n"
    );

    // Annotation + its score event land atomically, state moves to UnderReview
    let a = annotation("a1", "c1", "bob", 4);
    let ev = score_event("e1", "bob", "c1", ScoreEventKind::FirstComment, 2);
    store
        .commit_annotation("c1", &a, ChangeState::UnderReview, std::slice::from_ref(&ev))
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.change.state, ChangeState::UnderReview);
    assert_eq!(snap.annotations.len(), 1);
    // Anchor round-trips byte-exactly, including the context window
    assert_eq!(snap.annotations[0].anchor, a.anchor);
    assert_eq!(snap.annotations[0].body, a.body);

    // Reply threads under the annotation
    store
        .commit_reply(
            "c1",
            &Reply {
                id: "r1".to_owned(),
                annotation_id: "a1".to_owned(),
                author_id: "alice".to_owned(),
                body: "good catch, fixing".to_owned(),
                created_at: 1_150,
            },
        )
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.annotations[0].replies.len(), 1);
    assert_eq!(snap.annotations[0].replies[0].author_id, "alice");

    // Verdict upsert: second write replaces the first row
    let session = ReviewSession {
        change_id: "c1".to_owned(),
        reviewer_id: "bob".to_owned(),
        verdict: Verdict::RequestChanges,
        revision_idx: 0,
        updated_at: 1_200,
    };
    store
        .commit_verdict("c1", &session, ChangeState::ChangesRequested, &[])
        .await
        .unwrap();
    let approved = ReviewSession {
        verdict: Verdict::Approve,
        updated_at: 1_300,
        ..session
    };
    store
        .commit_verdict("c1", &approved, ChangeState::UnderReview, &[])
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.sessions.len(), 1, "upsert must not duplicate the session");
    assert_eq!(snap.sessions[0].verdict, Verdict::Approve);
    assert!(snap.sessions[0].is_stale(1), "older-revision verdict is stale");

    // Second revision orphans the annotation atomically
    let update = AnnotationUpdate {
        id: "a1".to_owned(),
        status: AnnotationStatus::Orphaned,
        orphan_reason: Some(OrphanReason::ContentNotFound),
        line: 4,
    };
    store
        .commit_revision(
            "c1",
            1,
            "@@ -1 +1 @@\n-b\n+c\n",
            1_400,
            std::slice::from_ref(&update),
            ChangeState::UnderReview,
        )
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.revision_count, 2);
    assert_eq!(snap.annotations[0].status, AnnotationStatus::Orphaned);
    assert_eq!(
        snap.annotations[0].orphan_reason,
        Some(OrphanReason::ContentNotFound)
    );

    // Terminal state commit
    store
        .commit_state("c1", ChangeState::Closed, 1_500, &[])
        .await
        .unwrap();
    let snap = store.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap.change.state, ChangeState::Closed);
    assert!(snap.change.state.is_terminal());

    // Verify persistence: open a second connection to same DB
    let store2 = SqliteStore::open(&path).await.unwrap();
    let snap2 = store2.load_change("c1").await.unwrap().unwrap();
    assert_eq!(snap2.annotations.len(), 1, "annotations persist across connections");
    assert_eq!(snap2.annotations[0].anchor, a.anchor);
}

#[tokio::test]
async fn score_log_folds_and_reverses() {
    let path = temp_db_path();
    let store = SqliteStore::open(&path).await.unwrap();
    store
        .create_change(&new_change("c1", "alice", &["bob"]))
        .await
        .unwrap();

    store
        .append_score_events(&[
            score_event("e1", "bob", "c1", ScoreEventKind::FirstComment, 2),
            score_event("e2", "bob", "c1", ScoreEventKind::Approval, 3),
            score_event("e3", "carol", "c1", ScoreEventKind::FirstComment, 2),
        ])
        .await
        .unwrap();

    let board = store.leaderboard(None, 10).await.unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].reviewer_id, "bob");
    assert_eq!(board[0].total, 5);
    assert_eq!(board[1].reviewer_id, "carol");
    assert_eq!(board[1].total, 2);

    // A reversal is an additive counter event, never an update
    let reversal = ScoreEvent {
        id: "e4".to_owned(),
        reviewer_id: "bob".to_owned(),
        change_id: "c1".to_owned(),
        kind: ScoreEventKind::Reversal,
        points: -3,
        reverses: Some("e2".to_owned()),
        created_at: 1_200,
    };
    store.append_score_events(&[reversal]).await.unwrap();

    let events = store.score_events_for("bob", None).await.unwrap();
    assert_eq!(events.len(), 3, "reversal appends, nothing is deleted");
    let total: i64 = events.iter().map(|e| e.points).sum();
    assert_eq!(total, 2, "reversal restores the prior total exactly");

    // Window filter: nothing before `since`
    let events = store.score_events_for("bob", Some(1_150)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ScoreEventKind::Reversal);

    // Leaderboard limit clips the tail
    let board = store.leaderboard(None, 1).await.unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].reviewer_id, "bob");
    assert_eq!(board[0].total, 2);
}
