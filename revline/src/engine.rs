//! Per-change orchestration: locking, ingestion ordering, and the exposed
//! operation surface.
//!
//! Each change is the unit of mutual exclusion. Mutating operations acquire
//! that change's async mutex (created on first access in a keyed lock map),
//! load one consistent snapshot, compute the outcome with the pure modules
//! (diff, anchor, state, scoring), and commit everything in a single store
//! transaction. Operations on different changes proceed fully in parallel,
//! and the read surface (`annotated_diff`, `change_state`, `leaderboard`)
//! never takes a lock.
//!
//! Revision ingestion is strictly ordered within a change: parse, then
//! re-anchor every active annotation, then evaluate the state machine, then
//! one atomic commit. Re-anchoring is CPU-bound and deterministic, so it
//! runs on the blocking pool under a configured time bound rather than
//! holding the async executor; exceeding the bound fails the ingestion
//! retryably with nothing committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use revline_core::store::{
    AnnotationUpdate, ChangeSnapshot, ChangeStore, LeaderboardEntry, NewChange,
};
use revline_core::types::{
    Annotation, AnnotationKind, AnnotationStatus, Change, ChangeState, Reply, ReviewSession,
    ScoreEvent, ScoreEventKind, Side, Verdict,
};

use crate::anchor;
use crate::annotations;
use crate::config::Config;
use crate::diff::{self, Revision};
use crate::error::{EngineError, Result};
use crate::host::{Reviewer, Role};
use crate::notify::{Notification, NotificationBus};
use crate::scoring::{self, Activity, ActivityContext, Window};
use crate::state;

/// Returns the current Unix timestamp in seconds.
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Keyed lock manager: one async mutex per change, created on first access.
///
/// The outer std mutex only guards the map itself and is never held across
/// an await point.
struct ChangeLocks {
    inner: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChangeLocks {
    fn new() -> Self {
        Self { inner: StdMutex::new(HashMap::new()) }
    }

    fn for_change(&self, change_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(change_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// One revision with the change's annotations at their current positions,
/// ready for the presentation layer.
#[derive(Debug, Clone)]
pub struct AnnotatedDiff {
    pub change_id: String,
    pub revision_idx: u32,
    pub revision: Revision,
    pub annotations: Vec<Annotation>,
}

/// Outcome of one revision ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub revision_idx: u32,
    /// Active annotations relocated to a new position.
    pub relocated: usize,
    /// Active annotations that became orphaned.
    pub orphaned: usize,
    pub state: ChangeState,
}

/// The review session engine: ingestion, annotations, verdicts, scoring,
/// and the query surface, over a pluggable [`ChangeStore`].
pub struct ReviewEngine {
    store: Arc<dyn ChangeStore>,
    cfg: Config,
    locks: ChangeLocks,
    notify_tx: UnboundedSender<Notification>,
}

impl ReviewEngine {
    /// Builds an engine over `store` and returns the notification stream
    /// the delivery collaborator should drain.
    pub fn new(
        store: Arc<dyn ChangeStore>,
        cfg: Config,
    ) -> (Self, UnboundedReceiver<Notification>) {
        let bus = NotificationBus::new();
        let engine = Self {
            store,
            cfg,
            locks: ChangeLocks::new(),
            notify_tx: bus.tx,
        };
        (engine, bus.rx)
    }

    /// Best-effort notification send; a gone consumer never fails a commit.
    fn emit(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }

    fn emit_score_events(&self, events: &[ScoreEvent]) {
        for e in events {
            self.emit(Notification::ScoreChanged {
                reviewer_id: e.reviewer_id.clone(),
                delta: e.points,
            });
        }
    }

    async fn snapshot(&self, change_id: &str) -> Result<ChangeSnapshot> {
        self.store
            .load_change(change_id)
            .await?
            .ok_or_else(|| EngineError::not_found("change", change_id))
    }

    fn guard_not_terminal(action: &'static str, snap: &ChangeSnapshot) -> Result<()> {
        if snap.change.state.is_terminal() {
            return Err(EngineError::policy(
                action,
                format!("change is {}", snap.change.state.as_str()),
            ));
        }
        Ok(())
    }

    /// Loads and parses the latest revision. The raw diff was validated at
    /// ingestion, so a parse failure here means the store was tampered with.
    async fn latest_revision(
        &self,
        action: &'static str,
        change_id: &str,
        snap: &ChangeSnapshot,
    ) -> Result<(u32, Revision)> {
        if snap.revision_count == 0 {
            return Err(EngineError::policy(action, "change has no revisions yet"));
        }
        let idx = snap.revision_count - 1;
        let raw = self
            .store
            .load_revision(change_id, idx)
            .await?
            .ok_or_else(|| EngineError::not_found("revision", format!("{change_id}#{idx}")))?;
        Ok((idx, diff::parse(&raw)?))
    }

    /// Whether a fast-response event already exists for this (reviewer,
    /// latest revision) pair.
    async fn fast_response_scored(
        &self,
        reviewer_id: &str,
        change_id: &str,
        revision_at: Option<i64>,
    ) -> Result<bool> {
        let Some(since) = revision_at else {
            return Ok(false);
        };
        let events = self.store.score_events_for(reviewer_id, Some(since)).await?;
        Ok(events
            .iter()
            .any(|e| e.kind == ScoreEventKind::FastResponse && e.change_id == change_id))
    }

    /// Registers a new change. State starts `Open` with no revisions.
    pub async fn create_change(
        &self,
        change_ref: &str,
        title: &str,
        author_id: &str,
        required_reviewers: Vec<String>,
    ) -> Result<Change> {
        let now = now_secs();
        let new = NewChange {
            id: Uuid::new_v4().to_string(),
            change_ref: change_ref.to_owned(),
            title: title.to_owned(),
            author_id: author_id.to_owned(),
            required_reviewers,
            created_at: now,
        };
        self.store.create_change(&new).await?;
        info!(change_id = %new.id, author = author_id, "change created");
        Ok(Change {
            id: new.id,
            change_ref: new.change_ref,
            title: new.title,
            author_id: new.author_id,
            state: ChangeState::Open,
            created_at: now,
            updated_at: now,
        })
    }

    /// Ingests a new revision: parse, re-anchor everything, evaluate the
    /// state machine, commit atomically.
    ///
    /// On any error the change remains at its prior revision with its
    /// annotations untouched; `ReanchorTimeout` in particular is retryable.
    pub async fn ingest_revision(&self, change_id: &str, raw_diff: &str) -> Result<IngestSummary> {
        // Parsing is pure; reject malformed input before touching the lock.
        let revision = diff::parse(raw_diff)?;

        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("ingest a revision", &snap)?;
        let idx = snap.revision_count;

        let bound = Duration::from_millis(self.cfg.engine.reanchor_timeout_ms);
        let annotation_set = snap.annotations.clone();
        let anchor_cfg = self.cfg.anchor.clone();
        let rev = revision.clone();
        let reanchor = tokio::task::spawn_blocking(move || {
            annotations::reanchor_all(&annotation_set, &rev, &anchor_cfg)
        });
        let updates = match tokio::time::timeout(bound, reanchor).await {
            Err(_) => {
                warn!(change_id, revision = idx, "re-anchor pass exceeded its time bound");
                return Err(EngineError::ReanchorTimeout(bound));
            }
            Ok(joined) => joined
                .map_err(|e| EngineError::Store(anyhow::anyhow!("re-anchor task failed: {e}")))?,
        };

        let new_state = state::after_new_revision(snap.change.state);
        let now = now_secs();
        self.store
            .commit_revision(change_id, idx, raw_diff, now, &updates, new_state)
            .await?;

        let orphaned = updates
            .iter()
            .filter(|u| u.status == AnnotationStatus::Orphaned)
            .count();
        for u in &updates {
            if let Some(reason) = u.orphan_reason {
                warn!(change_id, annotation_id = %u.id, reason = reason.as_str(), "annotation orphaned");
                self.emit(Notification::AnnotationOrphaned {
                    change_id: change_id.to_owned(),
                    annotation_id: u.id.clone(),
                    reason,
                });
            }
        }
        if new_state != snap.change.state {
            info!(change_id, from = snap.change.state.as_str(), to = new_state.as_str(), "state changed");
            self.emit(Notification::StatusChanged {
                change_id: change_id.to_owned(),
                state: new_state,
            });
        }
        debug!(
            change_id,
            revision = idx,
            relocated = updates.len() - orphaned,
            orphaned,
            "re-anchor pass committed"
        );

        Ok(IngestSummary {
            revision_idx: idx,
            relocated: updates.len() - orphaned,
            orphaned,
            state: new_state,
        })
    }

    /// Adds an inline annotation anchored to `line` on `side` of `path` in
    /// the latest revision. Scoring and the `Open -> UnderReview` move
    /// commit in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_annotation(
        &self,
        change_id: &str,
        author_id: &str,
        path: &str,
        side: Side,
        line: u32,
        kind: AnnotationKind,
        body: &str,
        patch: Option<String>,
    ) -> Result<Annotation> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("annotate", &snap)?;
        let (idx, revision) = self.latest_revision("annotate", change_id, &snap).await?;

        let anchor = anchor::anchor_at(&revision, path, side, line, &self.cfg.anchor)
            .ok_or_else(|| EngineError::not_found("diff line", format!("{path}:{line}")))?;

        let now = now_secs();
        let annotation = annotations::build(
            change_id,
            author_id,
            kind,
            body.to_owned(),
            patch,
            anchor,
            idx,
            now,
        );
        let new_state = state::after_annotation(snap.change.state);

        let min_len = self.cfg.scoring.min_substantive_len;
        let prior_substantive = snap
            .annotations
            .iter()
            .filter(|a| a.author_id == author_id && a.body.trim().len() >= min_len)
            .count();
        let recent_bodies = snap
            .annotations
            .iter()
            .filter(|a| a.author_id == author_id)
            .map(|a| (a.created_at, a.body.clone()))
            .collect();
        let ctx = ActivityContext {
            prior_substantive_comments: prior_substantive,
            recent_comment_bodies: recent_bodies,
            fast_response_already_scored: self
                .fast_response_scored(author_id, change_id, snap.latest_revision_at)
                .await?,
        };
        let activity = Activity::CommentPosted {
            change_id: change_id.to_owned(),
            change_author: snap.change.author_id.clone(),
            reviewer: author_id.to_owned(),
            body: body.to_owned(),
            revision_idx: idx,
            revision_at: snap.latest_revision_at.unwrap_or(now),
        };
        let events = scoring::on_activity(&self.cfg.scoring, &activity, &ctx, now);

        self.store
            .commit_annotation(change_id, &annotation, new_state, &events)
            .await?;

        self.emit(Notification::AnnotationAdded {
            change_id: change_id.to_owned(),
            annotation_id: annotation.id.clone(),
            author_id: author_id.to_owned(),
        });
        if new_state != snap.change.state {
            info!(change_id, from = snap.change.state.as_str(), to = new_state.as_str(), "state changed");
            self.emit(Notification::StatusChanged {
                change_id: change_id.to_owned(),
                state: new_state,
            });
        }
        self.emit_score_events(&events);

        Ok(annotation)
    }

    /// Appends a reply to an annotation's thread. Replies do not re-anchor
    /// and do not score.
    pub async fn add_reply(
        &self,
        change_id: &str,
        annotation_id: &str,
        author_id: &str,
        body: &str,
    ) -> Result<Reply> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("reply", &snap)?;
        annotations::find(&snap.annotations, annotation_id)
            .ok_or_else(|| EngineError::not_found("annotation", annotation_id))?;

        let reply = Reply {
            id: Uuid::new_v4().to_string(),
            annotation_id: annotation_id.to_owned(),
            author_id: author_id.to_owned(),
            body: body.to_owned(),
            created_at: now_secs(),
        };
        self.store.commit_reply(change_id, &reply).await?;
        Ok(reply)
    }

    /// Marks an active annotation resolved. Status never moves back.
    pub async fn resolve_annotation(&self, change_id: &str, annotation_id: &str) -> Result<()> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("resolve an annotation", &snap)?;
        let annotation = annotations::find(&snap.annotations, annotation_id)
            .ok_or_else(|| EngineError::not_found("annotation", annotation_id))?;
        if annotation.status != AnnotationStatus::Active {
            return Err(EngineError::policy(
                "resolve an annotation",
                format!("annotation is {}", annotation.status.as_str()),
            ));
        }

        let update = AnnotationUpdate {
            id: annotation.id.clone(),
            status: AnnotationStatus::Resolved,
            orphan_reason: None,
            line: annotation.anchor.line,
        };
        self.store
            .commit_annotation_status(change_id, &update, Some(now_secs()), &[])
            .await?;
        Ok(())
    }

    /// Clears an orphan by creating a new active annotation at the given
    /// position, linked to the old one via `supersedes`. The orphaned row
    /// keeps its status forever.
    pub async fn reattach_annotation(
        &self,
        change_id: &str,
        annotation_id: &str,
        path: &str,
        side: Side,
        line: u32,
    ) -> Result<Annotation> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("reattach an annotation", &snap)?;
        let old = annotations::find(&snap.annotations, annotation_id)
            .ok_or_else(|| EngineError::not_found("annotation", annotation_id))?;
        if old.status != AnnotationStatus::Orphaned {
            return Err(EngineError::policy(
                "reattach an annotation",
                format!("annotation is {}, not orphaned", old.status.as_str()),
            ));
        }
        let (idx, revision) = self
            .latest_revision("reattach an annotation", change_id, &snap)
            .await?;
        let anchor = anchor::anchor_at(&revision, path, side, line, &self.cfg.anchor)
            .ok_or_else(|| EngineError::not_found("diff line", format!("{path}:{line}")))?;

        let mut replacement = annotations::build(
            change_id,
            &old.author_id,
            old.kind,
            old.body.clone(),
            old.patch.clone(),
            anchor,
            idx,
            now_secs(),
        );
        replacement.supersedes = Some(old.id.clone());

        self.store
            .commit_annotation(change_id, &replacement, snap.change.state, &[])
            .await?;
        self.emit(Notification::AnnotationAdded {
            change_id: change_id.to_owned(),
            annotation_id: replacement.id.clone(),
            author_id: replacement.author_id.clone(),
        });
        Ok(replacement)
    }

    /// The change author accepts a suggestion: the annotation resolves and
    /// its author scores, atomically.
    pub async fn accept_suggestion(
        &self,
        change_id: &str,
        annotation_id: &str,
        actor_id: &str,
    ) -> Result<()> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("accept a suggestion", &snap)?;
        if actor_id != snap.change.author_id {
            return Err(EngineError::policy(
                "accept a suggestion",
                "only the change author may accept suggestions",
            ));
        }
        let annotation = annotations::find(&snap.annotations, annotation_id)
            .ok_or_else(|| EngineError::not_found("annotation", annotation_id))?;
        if annotation.kind != AnnotationKind::Suggestion {
            return Err(EngineError::policy(
                "accept a suggestion",
                "annotation is not a suggestion",
            ));
        }
        if annotation.status != AnnotationStatus::Active {
            return Err(EngineError::policy(
                "accept a suggestion",
                format!("annotation is {}", annotation.status.as_str()),
            ));
        }

        let now = now_secs();
        let activity = Activity::SuggestionAccepted {
            change_id: change_id.to_owned(),
            change_author: snap.change.author_id.clone(),
            suggestion_author: annotation.author_id.clone(),
        };
        let events =
            scoring::on_activity(&self.cfg.scoring, &activity, &ActivityContext::default(), now);

        let update = AnnotationUpdate {
            id: annotation.id.clone(),
            status: AnnotationStatus::Resolved,
            orphan_reason: None,
            line: annotation.anchor.line,
        };
        self.store
            .commit_annotation_status(change_id, &update, Some(now), &events)
            .await?;
        self.emit_score_events(&events);
        Ok(())
    }

    /// Records a reviewer's verdict on the latest revision and re-derives
    /// the change state from the full session set.
    pub async fn record_verdict(
        &self,
        change_id: &str,
        reviewer_id: &str,
        verdict: Verdict,
    ) -> Result<ChangeState> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("record a verdict", &snap)?;
        if reviewer_id == snap.change.author_id {
            return Err(EngineError::policy(
                "record a verdict",
                "the change author cannot review their own change",
            ));
        }
        if snap.revision_count == 0 {
            return Err(EngineError::policy(
                "record a verdict",
                "change has no revisions yet",
            ));
        }
        let latest = snap.revision_count - 1;
        let now = now_secs();
        let session = ReviewSession {
            change_id: change_id.to_owned(),
            reviewer_id: reviewer_id.to_owned(),
            verdict,
            revision_idx: latest,
            updated_at: now,
        };

        // Re-evaluate over the full session set, not just this verdict.
        let mut sessions = snap.sessions.clone();
        match sessions.iter_mut().find(|s| s.reviewer_id == reviewer_id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        let new_state = state::after_verdict(&sessions, &snap.required_reviewers, latest);

        let activity = Activity::VerdictRecorded {
            change_id: change_id.to_owned(),
            change_author: snap.change.author_id.clone(),
            reviewer: reviewer_id.to_owned(),
            revision_idx: latest,
            revision_at: snap.latest_revision_at.unwrap_or(now),
        };
        let ctx = ActivityContext {
            fast_response_already_scored: self
                .fast_response_scored(reviewer_id, change_id, snap.latest_revision_at)
                .await?,
            ..Default::default()
        };
        let events = scoring::on_activity(&self.cfg.scoring, &activity, &ctx, now);

        self.store
            .commit_verdict(change_id, &session, new_state, &events)
            .await?;

        if new_state != snap.change.state {
            info!(change_id, from = snap.change.state.as_str(), to = new_state.as_str(), "state changed");
            self.emit(Notification::StatusChanged {
                change_id: change_id.to_owned(),
                state: new_state,
            });
        }
        self.emit_score_events(&events);
        Ok(new_state)
    }

    /// Merges an approved change. Every fresh approver scores; the author
    /// never does.
    pub async fn merge_change(&self, change_id: &str, actor: &Reviewer) -> Result<()> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        if actor.id != snap.change.author_id && actor.role != Role::Admin {
            return Err(EngineError::policy(
                "merge",
                "only the change author or an admin may merge",
            ));
        }
        if snap.change.state != ChangeState::Approved {
            return Err(EngineError::policy(
                "merge",
                format!("change is {}, not approved", snap.change.state.as_str()),
            ));
        }

        let latest = snap.revision_count.saturating_sub(1);
        let approvers: Vec<String> = snap
            .sessions
            .iter()
            .filter(|s| s.verdict == Verdict::Approve && !s.is_stale(latest))
            .map(|s| s.reviewer_id.clone())
            .collect();
        let now = now_secs();
        let activity = Activity::ChangeMerged {
            change_id: change_id.to_owned(),
            change_author: snap.change.author_id.clone(),
            approvers,
        };
        let events =
            scoring::on_activity(&self.cfg.scoring, &activity, &ActivityContext::default(), now);

        self.store
            .commit_state(change_id, ChangeState::Merged, now, &events)
            .await?;
        info!(change_id, "change merged");
        self.emit(Notification::StatusChanged {
            change_id: change_id.to_owned(),
            state: ChangeState::Merged,
        });
        self.emit_score_events(&events);
        Ok(())
    }

    /// Closes a change from any non-terminal state.
    pub async fn close_change(&self, change_id: &str, actor: &Reviewer) -> Result<()> {
        let lock = self.locks.for_change(change_id);
        let _guard = lock.lock().await;

        let snap = self.snapshot(change_id).await?;
        Self::guard_not_terminal("close", &snap)?;
        if actor.id != snap.change.author_id && actor.role != Role::Admin {
            return Err(EngineError::policy(
                "close",
                "only the change author or an admin may close",
            ));
        }

        let now = now_secs();
        self.store
            .commit_state(change_id, ChangeState::Closed, now, &[])
            .await?;
        info!(change_id, "change closed");
        self.emit(Notification::StatusChanged {
            change_id: change_id.to_owned(),
            state: ChangeState::Closed,
        });
        Ok(())
    }

    /// Appends the additive correction for `original` to the score log.
    pub async fn reverse_event(&self, original: &ScoreEvent) -> Result<ScoreEvent> {
        let reversal = scoring::reversal_of(original, now_secs());
        self.store
            .append_score_events(std::slice::from_ref(&reversal))
            .await?;
        self.emit(Notification::ScoreChanged {
            reviewer_id: reversal.reviewer_id.clone(),
            delta: reversal.points,
        });
        Ok(reversal)
    }

    // --- Query surface. Reads never take the change lock. ---

    /// One revision's parsed diff plus the change's annotations at their
    /// current positions.
    pub async fn annotated_diff(&self, change_id: &str, revision_idx: u32) -> Result<AnnotatedDiff> {
        let snap = self.snapshot(change_id).await?;
        let raw = self
            .store
            .load_revision(change_id, revision_idx)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("revision", format!("{change_id}#{revision_idx}"))
            })?;
        Ok(AnnotatedDiff {
            change_id: change_id.to_owned(),
            revision_idx,
            revision: diff::parse(&raw)?,
            annotations: snap.annotations,
        })
    }

    /// Current lifecycle state of a change.
    pub async fn change_state(&self, change_id: &str) -> Result<ChangeState> {
        Ok(self.snapshot(change_id).await?.change.state)
    }

    /// Folded leaderboard for a time window, highest totals first.
    pub async fn leaderboard(&self, window: Window, limit: u32) -> Result<Vec<LeaderboardEntry>> {
        Ok(self.store.leaderboard(window.since(now_secs()), limit).await?)
    }

    /// One reviewer's total for a window, folded from their event log.
    pub async fn reviewer_total(&self, reviewer_id: &str, window: Window) -> Result<i64> {
        let events = self
            .store
            .score_events_for(reviewer_id, window.since(now_secs()))
            .await?;
        Ok(scoring::fold_total(&events, None))
    }
}
