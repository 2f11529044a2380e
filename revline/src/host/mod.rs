//! External collaborator interfaces: version-control host and identity.
//!
//! The engine never talks to a repository or an auth system directly; it
//! goes through the narrow traits here. [`GitHost`] is the bundled
//! implementation for local git repositories. It owns a background
//! `std::thread::spawn` thread for the repository handle — git2's
//! `Repository` is `!Send`, so it must be opened inside the thread, never
//! passed in. All communication is via channels: [`HostRequest`] in over a
//! crossbeam channel, replies out over per-request oneshot senders.

pub mod types;
pub mod worker;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;

pub use types::{ChangeRef, HostRequest};

/// A reviewer identity as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reviewer {
    pub id: String,
    pub role: Role,
}

/// Role attached to an identity. Admins may close changes they do not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reviewer,
    Admin,
}

/// Identity collaborator: who is acting right now.
pub trait Identity: Send + Sync {
    fn current_user(&self) -> Reviewer;
}

/// Fixed identity, for deployments where the caller is resolved upstream
/// (and for tests).
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user: Reviewer,
}

impl StaticIdentity {
    pub fn new(id: &str, role: Role) -> Self {
        Self { user: Reviewer { id: id.to_owned(), role } }
    }
}

impl Identity for StaticIdentity {
    fn current_user(&self) -> Reviewer {
        self.user.clone()
    }
}

/// Version-control host collaborator.
///
/// `fetch_diff` returns raw unified diff text ready for ingestion;
/// `fetch_revision_list` returns the ordered commit identifiers a change
/// ref spans, oldest first.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn fetch_diff(&self, change_ref: &ChangeRef) -> Result<String>;
    async fn fetch_revision_list(&self, change_ref: &ChangeRef) -> Result<Vec<String>>;
}

/// Local-git [`VcsHost`] backed by a dedicated repository thread.
///
/// Cheap to clone; all clones feed the same worker. Dropping every clone
/// closes the request channel and ends the thread.
#[derive(Clone)]
pub struct GitHost {
    tx: crossbeam_channel::Sender<HostRequest>,
}

impl GitHost {
    /// Spawns the repository thread for the git repository at `path`.
    ///
    /// The thread exits on its own when the repository cannot be opened;
    /// requests then fail with a channel-closed error rather than panicking.
    pub fn spawn(path: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let path = path.to_owned();
        std::thread::spawn(move || worker::host_worker_loop(path, rx));
        Self { tx }
    }

    async fn roundtrip<T>(
        &self,
        reply_rx: oneshot::Receiver<Result<T, git2::Error>>,
        sent: Result<(), crossbeam_channel::SendError<HostRequest>>,
    ) -> Result<T> {
        sent.map_err(|_| anyhow!("version-control host worker is gone"))?;
        let reply = reply_rx
            .await
            .map_err(|_| anyhow!("version-control host worker dropped the request"))?;
        reply.map_err(|e| anyhow!("git operation failed: {e}"))
    }
}

#[async_trait]
impl VcsHost for GitHost {
    async fn fetch_diff(&self, change_ref: &ChangeRef) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.tx.send(HostRequest::FetchDiff {
            change_ref: change_ref.clone(),
            reply: reply_tx,
        });
        self.roundtrip(reply_rx, sent).await
    }

    async fn fetch_revision_list(&self, change_ref: &ChangeRef) -> Result<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.tx.send(HostRequest::FetchRevisionList {
            change_ref: change_ref.clone(),
            reply: reply_tx,
        });
        self.roundtrip(reply_rx, sent).await
    }
}
