use serde::{Deserialize, Serialize};

/// Lifecycle state of a change under review.
///
/// Stored as TEXT in the `changes` table (CHECK-constrained). `Merged` and
/// `Closed` are terminal: no operation may mutate a change once it reaches
/// either of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Open,
    UnderReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

impl ChangeState {
    /// The TEXT value stored in SQLite for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeState::Open => "open",
            ChangeState::UnderReview => "under_review",
            ChangeState::ChangesRequested => "changes_requested",
            ChangeState::Approved => "approved",
            ChangeState::Merged => "merged",
            ChangeState::Closed => "closed",
        }
    }

    /// Parses the stored TEXT value back into a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ChangeState::Open),
            "under_review" => Some(ChangeState::UnderReview),
            "changes_requested" => Some(ChangeState::ChangesRequested),
            "approved" => Some(ChangeState::Approved),
            "merged" => Some(ChangeState::Merged),
            "closed" => Some(ChangeState::Closed),
            _ => None,
        }
    }

    /// True for `Merged` and `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChangeState::Merged | ChangeState::Closed)
    }
}

/// A reviewer's standing verdict on a change.
///
/// One verdict per (change, reviewer), attached to the revision index it was
/// recorded against. A verdict recorded against an older revision is *stale*
/// and must be re-affirmed before it counts toward approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    None,
    Approve,
    RequestChanges,
    CommentOnly,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::None => "none",
            Verdict::Approve => "approve",
            Verdict::RequestChanges => "request_changes",
            Verdict::CommentOnly => "comment_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Verdict::None),
            "approve" => Some(Verdict::Approve),
            "request_changes" => Some(Verdict::RequestChanges),
            "comment_only" => Some(Verdict::CommentOnly),
            _ => None,
        }
    }
}

/// Kind of an annotation: a plain review comment, or a suggestion that may
/// carry proposed replacement text and be accepted by the change author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Comment,
    Suggestion,
}

impl AnnotationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationKind::Comment => "comment",
            AnnotationKind::Suggestion => "suggestion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "comment" => Some(AnnotationKind::Comment),
            "suggestion" => Some(AnnotationKind::Suggestion),
            _ => None,
        }
    }
}

/// Annotation lifecycle status.
///
/// Moves `Active -> Resolved` or `Active -> Orphaned` only. Clearing an
/// orphan is an explicit user action that creates a *new* active annotation
/// linked via `supersedes`; the old row never moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationStatus {
    Active,
    Resolved,
    Orphaned,
}

impl AnnotationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationStatus::Active => "active",
            AnnotationStatus::Resolved => "resolved",
            AnnotationStatus::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AnnotationStatus::Active),
            "resolved" => Some(AnnotationStatus::Resolved),
            "orphaned" => Some(AnnotationStatus::Orphaned),
            _ => None,
        }
    }
}

/// Why an anchor could not be relocated in a newer revision.
///
/// Orphaning is a normal, displayed outcome — not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    /// No line in the new revision matched the anchored content above the
    /// similarity threshold.
    ContentNotFound,
    /// Several lines matched with identical score and proximity; picking one
    /// would risk silent misattribution.
    AmbiguousMatch,
}

impl OrphanReason {
    pub fn as_str(self) -> &'static str {
        match self {
            OrphanReason::ContentNotFound => "content not found",
            OrphanReason::AmbiguousMatch => "ambiguous match",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content not found" => Some(OrphanReason::ContentNotFound),
            "ambiguous match" => Some(OrphanReason::AmbiguousMatch),
            _ => None,
        }
    }
}

/// Which image of the diff a line number refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Old,
    New,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Old => "old",
            Side::New => "new",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "old" => Some(Side::Old),
            "new" => Some(Side::New),
            _ => None,
        }
    }
}

/// Kind of a score event. Stored as TEXT, CHECK-constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreEventKind {
    FirstComment,
    SuggestionAccepted,
    Approval,
    FastResponse,
    Reversal,
}

impl ScoreEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreEventKind::FirstComment => "first_comment",
            ScoreEventKind::SuggestionAccepted => "suggestion_accepted",
            ScoreEventKind::Approval => "approval",
            ScoreEventKind::FastResponse => "fast_response",
            ScoreEventKind::Reversal => "reversal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_comment" => Some(ScoreEventKind::FirstComment),
            "suggestion_accepted" => Some(ScoreEventKind::SuggestionAccepted),
            "approval" => Some(ScoreEventKind::Approval),
            "fast_response" => Some(ScoreEventKind::FastResponse),
            "reversal" => Some(ScoreEventKind::Reversal),
            _ => None,
        }
    }
}

/// A change under review: one proposed code modification spanning one or
/// more immutable revisions.
///
/// Keyed by UUID v4 text. Revisions, annotations, review sessions, and the
/// required-reviewer set all hang off this id.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: String,           // UUID v4 text
    /// Opaque handle understood by the version-control host (e.g. `main..topic`).
    pub change_ref: String,
    pub title: String,
    pub author_id: String,
    pub state: ChangeState,
    pub created_at: i64,      // Unix timestamp seconds
    pub updated_at: i64,
}

/// A content-addressed reference locating an annotation within a revision,
/// independent of line-number drift.
///
/// `line_hash` is the SHA-256 hex of the exact line content (whitespace
/// preserved); `context` holds the hashes of the surrounding lines on the
/// same side, in order, up to the configured radius each way. `line` is the
/// last known line number, used only to break ties between equally similar
/// candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub path: String,
    pub side: Side,
    pub line_hash: String,
    pub context: Vec<String>,
    pub line: u32,
}

/// A reply within an annotation's thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: String,           // UUID v4 text
    pub annotation_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at: i64,
}

/// An inline review comment or suggestion, identified stably for the life
/// of its change.
///
/// The anchor relocates the annotation across revisions; `anchor.line` is
/// updated on every successful re-anchor, while `id`, `body`, and
/// `created_revision` never change. `supersedes` links a reattached
/// annotation back to the orphaned one it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub id: String,           // UUID v4 text, stable across revisions
    pub change_id: String,
    pub author_id: String,
    pub kind: AnnotationKind,
    pub status: AnnotationStatus,
    pub body: String,
    /// Proposed replacement text, for suggestions produced by reviewers or
    /// by an automated suggestion collaborator.
    pub patch: Option<String>,
    pub anchor: Anchor,
    /// Index of the revision the annotation was created against.
    pub created_revision: u32,
    pub orphan_reason: Option<OrphanReason>,
    pub supersedes: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub replies: Vec<Reply>,
}

/// One reviewer's session on a change: their current verdict and the
/// revision index it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSession {
    pub change_id: String,
    pub reviewer_id: String,
    pub verdict: Verdict,
    pub revision_idx: u32,
    pub updated_at: i64,
}

impl ReviewSession {
    /// A session is stale when a newer revision has arrived since the
    /// verdict was recorded.
    pub fn is_stale(&self, latest_revision: u32) -> bool {
        self.revision_idx < latest_revision
    }
}

/// An immutable, auditable record of a point change to a reviewer's score.
///
/// Append-only: corrections are additive counter events (`reverses` points
/// at the corrected row, `points` carries the negation). Rows are never
/// mutated or deleted; totals are a fold over the log.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEvent {
    pub id: String,           // UUID v4 text
    pub reviewer_id: String,
    pub change_id: String,
    pub kind: ScoreEventKind,
    pub points: i64,
    pub reverses: Option<String>,
    pub created_at: i64,
}
