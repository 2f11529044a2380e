/// DDL to create the schema_version tracking table.
///
/// Applied unconditionally on every DB open (before checking the version),
/// using `IF NOT EXISTS` so it is safe to run multiple times.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    ) STRICT;
";

/// DDL for the full v1 schema.
///
/// Seven tables:
/// - `changes`: one row per change under review, keyed by UUID v4 text.
/// - `change_reviewers`: the required-reviewer set for a change.
/// - `revisions`: immutable raw unified diffs, strictly ordered by `idx`
///   within a change. Never updated, reordered, or deleted.
/// - `annotations`: inline comments/suggestions with their content anchors.
/// - `annotation_replies`: threaded replies under an annotation.
/// - `review_sessions`: one verdict row per (change, reviewer).
/// - `score_events`: append-only leaderboard facts. No cascade — the audit
///   log outlives everything else.
///
/// All tables use `STRICT` mode for type enforcement. Enumerated TEXT
/// columns carry CHECK constraints mirroring the enums in `types`.
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS changes (
        id          TEXT    PRIMARY KEY,
        change_ref  TEXT    NOT NULL,
        title       TEXT    NOT NULL DEFAULT '',
        author_id   TEXT    NOT NULL,
        state       TEXT    NOT NULL DEFAULT 'open'
                            CHECK(state IN ('open','under_review','changes_requested',
                                            'approved','merged','closed')),
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS change_reviewers (
        change_id   TEXT    NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
        reviewer_id TEXT    NOT NULL,
        PRIMARY KEY (change_id, reviewer_id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS revisions (
        change_id   TEXT    NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
        idx         INTEGER NOT NULL,
        raw_diff    TEXT    NOT NULL,
        created_at  INTEGER NOT NULL,
        PRIMARY KEY (change_id, idx)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS annotations (
        id               TEXT    PRIMARY KEY,
        change_id        TEXT    NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
        author_id        TEXT    NOT NULL,
        kind             TEXT    NOT NULL
                                 CHECK(kind IN ('comment','suggestion')),
        status           TEXT    NOT NULL DEFAULT 'active'
                                 CHECK(status IN ('active','resolved','orphaned')),
        body             TEXT    NOT NULL,
        patch            TEXT,
        file_path        TEXT    NOT NULL,
        side             TEXT    NOT NULL CHECK(side IN ('old','new')),
        line_hash        TEXT    NOT NULL,
        context_hashes   TEXT    NOT NULL,
        line_number      INTEGER NOT NULL,
        created_revision INTEGER NOT NULL,
        orphan_reason    TEXT,
        supersedes       TEXT    REFERENCES annotations(id) ON DELETE SET NULL,
        created_at       INTEGER NOT NULL,
        resolved_at      INTEGER
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_annotations_change
        ON annotations(change_id, created_at);

    CREATE TABLE IF NOT EXISTS annotation_replies (
        id            TEXT    PRIMARY KEY,
        annotation_id TEXT    NOT NULL REFERENCES annotations(id) ON DELETE CASCADE,
        author_id     TEXT    NOT NULL,
        body          TEXT    NOT NULL,
        created_at    INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS review_sessions (
        change_id    TEXT    NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
        reviewer_id  TEXT    NOT NULL,
        verdict      TEXT    NOT NULL DEFAULT 'none'
                             CHECK(verdict IN ('none','approve','request_changes','comment_only')),
        revision_idx INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL,
        PRIMARY KEY (change_id, reviewer_id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS score_events (
        id          TEXT    PRIMARY KEY,
        reviewer_id TEXT    NOT NULL,
        change_id   TEXT    NOT NULL REFERENCES changes(id),
        kind        TEXT    NOT NULL
                            CHECK(kind IN ('first_comment','suggestion_accepted',
                                           'approval','fast_response','reversal')),
        points      INTEGER NOT NULL,
        reverses    TEXT    REFERENCES score_events(id),
        created_at  INTEGER NOT NULL
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_score_events_reviewer
        ON score_events(reviewer_id, created_at);
";

/// Runs forward-only schema migration to migrate the DB to the latest version.
///
/// This function is idempotent: safe to call on every startup regardless of
/// whether the schema has already been applied.
///
/// # Process
///
/// 1. Creates the `schema_version` table if it does not exist.
/// 2. Reads the current version (`0` if the table is empty).
/// 3. If the version is below 1, applies `SCHEMA_V1_SQL` inside a
///    `BEGIN IMMEDIATE` transaction and records `version = 1`.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the DDL fails or the version row cannot be read.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }

    Ok(())
}
