use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::store::{
    AnnotationUpdate, ChangeSnapshot, ChangeStore, LeaderboardEntry, NewChange,
};
use crate::types::{
    Annotation, AnnotationKind, AnnotationStatus, Anchor, Change, ChangeState, OrphanReason,
    Reply, ReviewSession, ScoreEvent, ScoreEventKind, Side, Verdict,
};

/// Opens (or creates) the SQLite database at `path`, configures WAL mode,
/// and applies schema migrations via the `schema_version` table.
///
/// This function is the single entry point for all database connections.
/// It sets `busy_timeout` via the `Connection` method (not a PRAGMA string) to
/// ensure the setting takes effect regardless of pragma caching.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the file cannot be opened, WAL configuration
/// fails, or schema DDL fails.
pub async fn open_db(path: &str) -> Result<Connection, tokio_rusqlite::Error> {
    let conn = Connection::open(path).await?;

    // Step 1: WAL pragmas — connection-level settings re-applied on every open.
    conn.call(|db| {
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        // busy_timeout via Connection method (not PRAGMA string) per locked decision.
        db.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    })
    .await?;

    // Step 2: Checkpoint any leftover WAL from a previous run. The engine
    // process is the single writer, so this is safe on every open.
    conn.call(|db| {
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    })
    .await?;

    // Step 3: Apply schema migrations via schema_version versioning system.
    conn.call(|db| {
        crate::schema::migrate(db)?;
        Ok(())
    })
    .await?;

    Ok(conn)
}

/// Builds a conversion error for an unrecognized TEXT enum value read from
/// a CHECK-constrained column.
fn bad_text(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognized {column} value: {value}").into(),
    )
}

/// Inserts score events within an open transaction.
fn insert_score_events(
    tx: &rusqlite::Transaction<'_>,
    events: &[ScoreEvent],
) -> rusqlite::Result<()> {
    for e in events {
        tx.execute(
            "INSERT INTO score_events (id, reviewer_id, change_id, kind, points, reverses, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                &e.id,
                &e.reviewer_id,
                &e.change_id,
                e.kind.as_str(),
                e.points,
                &e.reverses,
                e.created_at,
            ],
        )?;
    }
    Ok(())
}

/// Applies one re-anchor outcome to an annotation row within an open transaction.
fn apply_annotation_update(
    tx: &rusqlite::Transaction<'_>,
    change_id: &str,
    update: &AnnotationUpdate,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE annotations
         SET status = ?1, orphan_reason = ?2, line_number = ?3
         WHERE id = ?4 AND change_id = ?5",
        rusqlite::params![
            update.status.as_str(),
            update.orphan_reason.map(OrphanReason::as_str),
            update.line as i64,
            &update.id,
            change_id,
        ],
    )?;
    Ok(())
}

/// SQLite-backed [`ChangeStore`].
///
/// Owns a single `tokio_rusqlite` connection; all calls are serialized on
/// its worker thread, and every mutating trait method runs as one
/// `BEGIN IMMEDIATE` transaction.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens the database at `path` (WAL mode, migrated) and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `tokio_rusqlite::Error` if [`open_db`] fails.
    pub async fn open(path: &str) -> Result<Self, tokio_rusqlite::Error> {
        let conn = open_db(path).await?;
        Ok(Self { conn })
    }

    /// Wraps an already-opened connection (tests reuse [`open_db`] directly).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    async fn load_change_inner(
        &self,
        change_id: String,
    ) -> Result<Option<ChangeSnapshot>, tokio_rusqlite::Error> {
        self.conn
            .call(move |db| {
                let change: Option<Change> = db
                    .query_row(
                        "SELECT id, change_ref, title, author_id, state, created_at, updated_at
                         FROM changes WHERE id = ?1",
                        rusqlite::params![&change_id],
                        |r| {
                            let state: String = r.get(4)?;
                            Ok(Change {
                                id: r.get(0)?,
                                change_ref: r.get(1)?,
                                title: r.get(2)?,
                                author_id: r.get(3)?,
                                state: ChangeState::parse(&state)
                                    .ok_or_else(|| bad_text("state", &state))?,
                                created_at: r.get(5)?,
                                updated_at: r.get(6)?,
                            })
                        },
                    )
                    .optional()?;

                let change = match change {
                    Some(c) => c,
                    None => return Ok(None),
                };

                let mut stmt = db.prepare(
                    "SELECT reviewer_id FROM change_reviewers WHERE change_id = ?1
                     ORDER BY reviewer_id",
                )?;
                let required_reviewers = stmt
                    .query_map(rusqlite::params![&change_id], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let (revision_count, latest_revision_at): (i64, Option<i64>) = db.query_row(
                    "SELECT COUNT(*), MAX(created_at) FROM revisions WHERE change_id = ?1",
                    rusqlite::params![&change_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;

                let mut stmt = db.prepare(
                    "SELECT change_id, reviewer_id, verdict, revision_idx, updated_at
                     FROM review_sessions WHERE change_id = ?1 ORDER BY reviewer_id",
                )?;
                let sessions = stmt
                    .query_map(rusqlite::params![&change_id], |r| {
                        let verdict: String = r.get(2)?;
                        Ok(ReviewSession {
                            change_id: r.get(0)?,
                            reviewer_id: r.get(1)?,
                            verdict: Verdict::parse(&verdict)
                                .ok_or_else(|| bad_text("verdict", &verdict))?,
                            revision_idx: r.get::<_, i64>(3)? as u32,
                            updated_at: r.get(4)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stmt = db.prepare(
                    "SELECT id, author_id, kind, status, body, patch, file_path, side,
                            line_hash, context_hashes, line_number, created_revision,
                            orphan_reason, supersedes, created_at, resolved_at
                     FROM annotations WHERE change_id = ?1 ORDER BY created_at, id",
                )?;
                let mut annotations = stmt
                    .query_map(rusqlite::params![&change_id], |r| {
                        let kind: String = r.get(2)?;
                        let status: String = r.get(3)?;
                        let side: String = r.get(7)?;
                        let context_json: String = r.get(9)?;
                        let context: Vec<String> = serde_json::from_str(&context_json)
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(
                                    9,
                                    rusqlite::types::Type::Text,
                                    Box::new(e),
                                )
                            })?;
                        let orphan_reason: Option<String> = r.get(12)?;
                        let orphan_reason = match orphan_reason {
                            Some(s) => Some(
                                OrphanReason::parse(&s)
                                    .ok_or_else(|| bad_text("orphan_reason", &s))?,
                            ),
                            None => None,
                        };
                        Ok(Annotation {
                            id: r.get(0)?,
                            change_id: change_id.clone(),
                            author_id: r.get(1)?,
                            kind: AnnotationKind::parse(&kind)
                                .ok_or_else(|| bad_text("kind", &kind))?,
                            status: AnnotationStatus::parse(&status)
                                .ok_or_else(|| bad_text("status", &status))?,
                            body: r.get(4)?,
                            patch: r.get(5)?,
                            anchor: Anchor {
                                path: r.get(6)?,
                                side: Side::parse(&side)
                                    .ok_or_else(|| bad_text("side", &side))?,
                                line_hash: r.get(8)?,
                                context,
                                line: r.get::<_, i64>(10)? as u32,
                            },
                            created_revision: r.get::<_, i64>(11)? as u32,
                            orphan_reason,
                            supersedes: r.get(13)?,
                            created_at: r.get(14)?,
                            resolved_at: r.get(15)?,
                            replies: Vec::new(),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                // Stitch replies onto their annotations in one pass.
                let index: HashMap<String, usize> = annotations
                    .iter()
                    .enumerate()
                    .map(|(i, a)| (a.id.clone(), i))
                    .collect();
                let mut stmt = db.prepare(
                    "SELECT r.id, r.annotation_id, r.author_id, r.body, r.created_at
                     FROM annotation_replies r
                     JOIN annotations a ON a.id = r.annotation_id
                     WHERE a.change_id = ?1 ORDER BY r.created_at, r.id",
                )?;
                let replies = stmt
                    .query_map(rusqlite::params![&change_id], |r| {
                        Ok(Reply {
                            id: r.get(0)?,
                            annotation_id: r.get(1)?,
                            author_id: r.get(2)?,
                            body: r.get(3)?,
                            created_at: r.get(4)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for reply in replies {
                    if let Some(&i) = index.get(&reply.annotation_id) {
                        annotations[i].replies.push(reply);
                    }
                }

                Ok(Some(ChangeSnapshot {
                    change,
                    required_reviewers,
                    revision_count: revision_count as u32,
                    latest_revision_at,
                    sessions,
                    annotations,
                }))
            })
            .await
    }
}

#[async_trait]
impl ChangeStore for SqliteStore {
    async fn create_change(&self, change: &NewChange) -> Result<()> {
        let c = change.clone();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO changes (id, change_ref, title, author_id, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)",
                    rusqlite::params![&c.id, &c.change_ref, &c.title, &c.author_id, c.created_at],
                )?;
                for reviewer in &c.required_reviewers {
                    tx.execute(
                        "INSERT OR IGNORE INTO change_reviewers (change_id, reviewer_id)
                         VALUES (?1, ?2)",
                        rusqlite::params![&c.id, reviewer],
                    )?;
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn load_change(&self, change_id: &str) -> Result<Option<ChangeSnapshot>> {
        Ok(self.load_change_inner(change_id.to_owned()).await?)
    }

    async fn load_revision(&self, change_id: &str, idx: u32) -> Result<Option<String>> {
        let change_id = change_id.to_owned();
        let raw = self
            .conn
            .call(move |db| {
                let raw: Option<String> = db
                    .query_row(
                        "SELECT raw_diff FROM revisions WHERE change_id = ?1 AND idx = ?2",
                        rusqlite::params![&change_id, idx as i64],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok::<_, rusqlite::Error>(raw)
            })
            .await?;
        Ok(raw)
    }

    async fn commit_revision(
        &self,
        change_id: &str,
        idx: u32,
        raw_diff: &str,
        created_at: i64,
        updates: &[AnnotationUpdate],
        state: ChangeState,
    ) -> Result<()> {
        let change_id = change_id.to_owned();
        let raw_diff = raw_diff.to_owned();
        let updates = updates.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO revisions (change_id, idx, raw_diff, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![&change_id, idx as i64, &raw_diff, created_at],
                )?;
                for update in &updates {
                    apply_annotation_update(&tx, &change_id, update)?;
                }
                tx.execute(
                    "UPDATE changes SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![state.as_str(), created_at, &change_id],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn commit_annotation(
        &self,
        change_id: &str,
        annotation: &Annotation,
        state: ChangeState,
        events: &[ScoreEvent],
    ) -> Result<()> {
        let change_id = change_id.to_owned();
        let a = annotation.clone();
        let context_json = serde_json::to_string(&a.anchor.context)?;
        let events = events.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO annotations (id, change_id, author_id, kind, status, body, patch,
                                              file_path, side, line_hash, context_hashes,
                                              line_number, created_revision, orphan_reason,
                                              supersedes, created_at, resolved_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    rusqlite::params![
                        &a.id,
                        &change_id,
                        &a.author_id,
                        a.kind.as_str(),
                        a.status.as_str(),
                        &a.body,
                        &a.patch,
                        &a.anchor.path,
                        a.anchor.side.as_str(),
                        &a.anchor.line_hash,
                        &context_json,
                        a.anchor.line as i64,
                        a.created_revision as i64,
                        a.orphan_reason.map(OrphanReason::as_str),
                        &a.supersedes,
                        a.created_at,
                        a.resolved_at,
                    ],
                )?;
                insert_score_events(&tx, &events)?;
                tx.execute(
                    "UPDATE changes SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![state.as_str(), a.created_at, &change_id],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn commit_reply(&self, change_id: &str, reply: &Reply) -> Result<()> {
        let change_id = change_id.to_owned();
        let r = reply.clone();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO annotation_replies (id, annotation_id, author_id, body, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![&r.id, &r.annotation_id, &r.author_id, &r.body, r.created_at],
                )?;
                tx.execute(
                    "UPDATE changes SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![r.created_at, &change_id],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn commit_annotation_status(
        &self,
        change_id: &str,
        update: &AnnotationUpdate,
        resolved_at: Option<i64>,
        events: &[ScoreEvent],
    ) -> Result<()> {
        let change_id = change_id.to_owned();
        let update = update.clone();
        let events = events.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                apply_annotation_update(&tx, &change_id, &update)?;
                if let Some(ts) = resolved_at {
                    tx.execute(
                        "UPDATE annotations SET resolved_at = ?1 WHERE id = ?2 AND change_id = ?3",
                        rusqlite::params![ts, &update.id, &change_id],
                    )?;
                    tx.execute(
                        "UPDATE changes SET updated_at = ?1 WHERE id = ?2",
                        rusqlite::params![ts, &change_id],
                    )?;
                }
                insert_score_events(&tx, &events)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn commit_verdict(
        &self,
        change_id: &str,
        session: &ReviewSession,
        state: ChangeState,
        events: &[ScoreEvent],
    ) -> Result<()> {
        let change_id = change_id.to_owned();
        let s = session.clone();
        let events = events.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO review_sessions (change_id, reviewer_id, verdict, revision_idx, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(change_id, reviewer_id)
                     DO UPDATE SET verdict = excluded.verdict,
                                   revision_idx = excluded.revision_idx,
                                   updated_at = excluded.updated_at",
                    rusqlite::params![
                        &change_id,
                        &s.reviewer_id,
                        s.verdict.as_str(),
                        s.revision_idx as i64,
                        s.updated_at,
                    ],
                )?;
                insert_score_events(&tx, &events)?;
                tx.execute(
                    "UPDATE changes SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![state.as_str(), s.updated_at, &change_id],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn commit_state(
        &self,
        change_id: &str,
        state: ChangeState,
        updated_at: i64,
        events: &[ScoreEvent],
    ) -> Result<()> {
        let change_id = change_id.to_owned();
        let events = events.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                tx.execute(
                    "UPDATE changes SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![state.as_str(), updated_at, &change_id],
                )?;
                insert_score_events(&tx, &events)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn append_score_events(&self, events: &[ScoreEvent]) -> Result<()> {
        let events = events.to_vec();
        self.conn
            .call(move |db| {
                let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                insert_score_events(&tx, &events)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn score_events_for(
        &self,
        reviewer_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<ScoreEvent>> {
        let reviewer_id = reviewer_id.to_owned();
        let since = since.unwrap_or(i64::MIN);
        let events = self
            .conn
            .call(move |db| {
                let mut stmt = db.prepare(
                    "SELECT id, reviewer_id, change_id, kind, points, reverses, created_at
                     FROM score_events
                     WHERE reviewer_id = ?1 AND created_at >= ?2
                     ORDER BY created_at, id",
                )?;
                let events = stmt
                    .query_map(rusqlite::params![&reviewer_id, since], |r| {
                        let kind: String = r.get(3)?;
                        Ok(ScoreEvent {
                            id: r.get(0)?,
                            reviewer_id: r.get(1)?,
                            change_id: r.get(2)?,
                            kind: ScoreEventKind::parse(&kind)
                                .ok_or_else(|| bad_text("kind", &kind))?,
                            points: r.get(4)?,
                            reverses: r.get(5)?,
                            created_at: r.get(6)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(events)
            })
            .await?;
        Ok(events)
    }

    async fn leaderboard(&self, since: Option<i64>, limit: u32) -> Result<Vec<LeaderboardEntry>> {
        let since = since.unwrap_or(i64::MIN);
        let entries = self
            .conn
            .call(move |db| {
                let mut stmt = db.prepare(
                    "SELECT reviewer_id, SUM(points) AS total
                     FROM score_events
                     WHERE created_at >= ?1
                     GROUP BY reviewer_id
                     ORDER BY total DESC, reviewer_id
                     LIMIT ?2",
                )?;
                let entries = stmt
                    .query_map(rusqlite::params![since, limit as i64], |r| {
                        Ok(LeaderboardEntry {
                            reviewer_id: r.get(0)?,
                            total: r.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(entries)
            })
            .await?;
        Ok(entries)
    }
}
