//! Owned request types for the version-control host thread.
//!
//! Requests cross from async engine code into the background thread that
//! owns the `git2::Repository`, so everything here is fully owned and
//! `Send`. Replies travel back over the embedded oneshot senders.

use tokio::sync::oneshot;

/// The two refs a change spans: diffs and revision lists are computed over
/// `base..head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRef {
    /// The ref the change branched from (older commit or branch tip).
    pub base: String,
    /// The ref holding the proposed work (newer commit or branch tip).
    pub head: String,
}

impl ChangeRef {
    pub fn new(base: &str, head: &str) -> Self {
        Self { base: base.to_owned(), head: head.to_owned() }
    }
}

/// Commands sent from the engine to the host background thread.
///
/// Sent over a `crossbeam_channel::Sender<HostRequest>`; the worker thread
/// receives these, performs the git operation, and answers on `reply`.
#[derive(Debug)]
pub enum HostRequest {
    /// Render the `base..head` tree diff as unified patch text.
    FetchDiff {
        change_ref: ChangeRef,
        reply: oneshot::Sender<Result<String, git2::Error>>,
    },
    /// List the commit ids reachable from `head` but not `base`, oldest first.
    FetchRevisionList {
        change_ref: ChangeRef,
        reply: oneshot::Sender<Result<Vec<String>, git2::Error>>,
    },
}
