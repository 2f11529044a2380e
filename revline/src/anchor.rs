//! Content-addressed anchor construction and resolution.
//!
//! An anchor remembers *what* a comment points at (the SHA-256 of the exact
//! line plus a window of surrounding line hashes), not *where* it was. When
//! a new revision arrives, `resolve` relocates the anchor by content: every
//! line with a matching hash is a candidate, candidates are scored by the
//! normalized longest-common-subsequence overlap of their context windows,
//! and only a sufficiently similar candidate wins. Anything less confident
//! orphans the annotation instead of silently re-pinning it to an unrelated
//! line.
//!
//! Resolution never fails fatally — `Orphaned` is a normal, displayed state.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use similar::{capture_diff_slices, Algorithm, DiffOp};

use revline_core::types::{Anchor, OrphanReason, Side};

use crate::diff::Revision;

/// Tunables for anchor construction and matching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Context lines hashed on each side of the anchored line.
    pub radius: usize,
    /// Minimum normalized window overlap (`2·lcs / (|a|+|b|)`) a candidate
    /// must reach to be accepted.
    pub threshold: f64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self { radius: 3, threshold: 0.5 }
    }
}

/// Outcome of relocating an anchor in a newer revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The anchor was confidently relocated to this line.
    Located { line: u32, side: Side },
    /// The anchor could not be relocated; the reason is displayed to users.
    Orphaned(OrphanReason),
}

/// SHA-256 hex of one line's exact content (whitespace-sensitive).
pub fn line_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// The numbered, hashed lines visible on one side of one file's diff.
///
/// Old side: context + removed lines; new side: context + added lines.
/// Hunks are ordered, so line numbers come out strictly increasing.
fn side_lines(rev: &Revision, path: &str, side: Side) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    if let Some(file) = rev.file(path) {
        for hunk in &file.hunks {
            for l in &hunk.lines {
                let n = match side {
                    Side::Old => l.old_line,
                    Side::New => l.new_line,
                };
                if let Some(n) = n {
                    out.push((n, line_hash(&l.content)));
                }
            }
        }
    }
    out
}

/// Hashes of the lines surrounding index `idx`, excluding the line itself,
/// up to `radius` each way.
fn window(lines: &[(u32, String)], idx: usize, radius: usize) -> Vec<String> {
    let start = idx.saturating_sub(radius);
    let end = (idx + radius + 1).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .filter(|(i, _)| start + i != idx)
        .map(|(_, (_, h))| h.clone())
        .collect()
}

/// Normalized LCS overlap of two hash windows: `2·common / (|a|+|b|)`.
///
/// Two empty windows are identical by definition (single-line files).
fn window_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let ops = capture_diff_slices(Algorithm::Myers, a, b);
    let common: usize = ops
        .iter()
        .map(|op| match op {
            DiffOp::Equal { len, .. } => *len,
            _ => 0,
        })
        .sum();
    (2.0 * common as f64) / ((a.len() + b.len()) as f64)
}

/// Builds an anchor for the line numbered `line` on `side` of `path` in
/// `rev`, or `None` if that line is not visible in the revision's diff.
pub fn anchor_at(
    rev: &Revision,
    path: &str,
    side: Side,
    line: u32,
    cfg: &AnchorConfig,
) -> Option<Anchor> {
    let lines = side_lines(rev, path, side);
    let idx = lines.iter().position(|(n, _)| *n == line)?;
    Some(Anchor {
        path: path.to_owned(),
        side,
        line_hash: lines[idx].1.clone(),
        context: window(&lines, idx, cfg.radius),
        line,
    })
}

/// Relocates `anchor` within `rev`.
///
/// Candidates are the lines on the anchor's side whose content hash matches
/// exactly. The best context-window overlap wins if it reaches the
/// threshold; ties go to the candidate closest to the last known line; a
/// residual tie is ambiguous and orphans rather than guessing.
pub fn resolve(anchor: &Anchor, rev: &Revision, cfg: &AnchorConfig) -> Resolution {
    let lines = side_lines(rev, &anchor.path, anchor.side);

    let mut candidates: Vec<(u32, f64, u32)> = Vec::new();
    for (idx, (n, h)) in lines.iter().enumerate() {
        if *h != anchor.line_hash {
            continue;
        }
        let score = window_overlap(&anchor.context, &window(&lines, idx, cfg.radius));
        candidates.push((*n, score, n.abs_diff(anchor.line)));
    }

    let best_score = candidates
        .iter()
        .map(|(_, s, _)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    if candidates.is_empty() || best_score < cfg.threshold {
        return Resolution::Orphaned(OrphanReason::ContentNotFound);
    }

    // Scores at the top are computed from identical integer ratios, so exact
    // equality is the right tie test here.
    let top: Vec<(u32, f64, u32)> = candidates
        .into_iter()
        .filter(|(_, s, _)| *s == best_score)
        .collect();
    let min_dist = top.iter().map(|(_, _, d)| *d).min().unwrap_or(0);
    let nearest: Vec<&(u32, f64, u32)> =
        top.iter().filter(|(_, _, d)| *d == min_dist).collect();

    if nearest.len() > 1 {
        return Resolution::Orphaned(OrphanReason::AmbiguousMatch);
    }
    Resolution::Located { line: nearest[0].0, side: anchor.side }
}
