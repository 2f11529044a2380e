//! Outbound notification events.
//!
//! Engine mutations emit [`Notification`] values over a single tokio
//! unbounded MPSC channel. The delivery collaborator (mail, webhooks,
//! in-app feeds) owns the receiving half; the engine only ever calls
//! `send` and ignores the result — delivery is best-effort and never
//! affects the correctness of a committed mutation.

use tokio::sync::mpsc;

use revline_core::types::{ChangeState, OrphanReason};

/// All events the engine reports to the notification collaborator.
///
/// Marked `#[non_exhaustive]` so new variants (mentions, digest batching)
/// do not break exhaustive match arms in existing delivery handlers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Notification {
    /// A reviewer added an inline annotation.
    AnnotationAdded {
        change_id: String,
        annotation_id: String,
        author_id: String,
    },
    /// A change moved to a new lifecycle state.
    StatusChanged {
        change_id: String,
        state: ChangeState,
    },
    /// A re-anchor pass could not relocate an annotation; surfaced to users
    /// for manual reconciliation.
    AnnotationOrphaned {
        change_id: String,
        annotation_id: String,
        reason: OrphanReason,
    },
    /// A reviewer's leaderboard score changed by `delta` points.
    ScoreChanged {
        reviewer_id: String,
        delta: i64,
    },
}

/// Holds the sender and receiver ends of the notification channel.
///
/// The sender (`tx`) is cloned into the engine; the receiver (`rx`) is
/// handed to the delivery collaborator.
pub struct NotificationBus {
    /// Send half — clone this for each component that produces notifications.
    pub tx: mpsc::UnboundedSender<Notification>,
    /// Receive half — owned by the delivery loop; call `.recv().await` to
    /// block until the next notification.
    pub rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationBus {
    /// Creates a new bus with a fresh unbounded channel.
    ///
    /// Unbounded is appropriate here because producers emit at the rate of
    /// committed review mutations, and a stalled consumer must never block
    /// a commit. If a deployment needs backpressure on delivery, that
    /// belongs in the delivery collaborator, not here.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
