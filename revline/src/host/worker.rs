//! Background thread that owns git2::Repository for its lifetime.
//!
//! git2::Repository is !Send — it must be opened inside the thread, not
//! passed in. All communication is via channels: HostRequest in, a reply on
//! the request's oneshot sender out.

use crossbeam_channel::Receiver;
use git2::{Diff, DiffFormat, DiffOptions, Repository, Sort};

use crate::host::types::{ChangeRef, HostRequest};

/// Entry point for the background thread that owns the git Repository.
///
/// Opens the Repository at `path` and loops over incoming `HostRequest`
/// messages until the channel is closed (every sender dropped). If the
/// repository cannot be opened the thread exits immediately; pending and
/// future requests then observe a dropped reply channel.
pub fn host_worker_loop(path: String, rx: Receiver<HostRequest>) {
    let repo = match Repository::open(&path) {
        Ok(r) => r,
        Err(_) => {
            return;
        }
    };

    for request in rx {
        match request {
            HostRequest::FetchDiff { change_ref, reply } => {
                let _ = reply.send(render_diff(&repo, &change_ref));
            }
            HostRequest::FetchRevisionList { change_ref, reply } => {
                let _ = reply.send(list_revisions(&repo, &change_ref));
            }
        }
    }
}

/// Resolves the two refs to trees and diffs them.
///
/// Returns git2::Error if either ref cannot be resolved or tree-walking fails.
fn tree_diff<'a>(repo: &'a Repository, change_ref: &ChangeRef) -> Result<Diff<'a>, git2::Error> {
    let old_obj = repo.revparse_single(&change_ref.base)?;
    let old_commit = old_obj.peel_to_commit()?;
    let old_tree = old_commit.tree()?;

    let new_obj = repo.revparse_single(&change_ref.head)?;
    let new_commit = new_obj.peel_to_commit()?;
    let new_tree = new_commit.tree()?;

    let mut opts = DiffOptions::new();
    repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))
}

/// Renders the `base..head` diff as unified patch text.
///
/// `DiffFormat::Patch` emits file and hunk header lines with their origin
/// characters 'F'/'H'; those pass through without a marker, while content
/// lines are prefixed with their '+'/'-'/' ' origin — reproducing the text
/// form `git diff` prints.
fn render_diff(repo: &Repository, change_ref: &ChangeRef) -> Result<String, git2::Error> {
    let diff = tree_diff(repo, change_ref)?;
    let mut out = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => out.push(line.origin()),
            _ => {}
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;
    Ok(out)
}

/// Lists commit ids reachable from `head` but not `base`, oldest first.
fn list_revisions(repo: &Repository, change_ref: &ChangeRef) -> Result<Vec<String>, git2::Error> {
    let mut walk = repo.revwalk()?;
    walk.push_range(&format!("{}..{}", change_ref.base, change_ref.head))?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    walk.map(|oid| oid.map(|o| o.to_string())).collect()
}
