//! Unified-diff parsing into an addressable line/hunk structure.
//!
//! `parse` turns raw unified diff text into a pure [`Revision`] value: files
//! in order, hunks in order, every line tagged and numbered on the old/new
//! side per standard 1-based diff convention. Content is preserved exactly
//! (whitespace included) because anchor hashing depends on it.
//!
//! Parsing never mutates prior state; a malformed diff is rejected before
//! the engine touches anything.

use serde::Serialize;
use thiserror::Error;

/// The type of change for a diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

/// A single line within a diff hunk.
///
/// Removed lines carry only `old_line`, added lines only `new_line`,
/// context lines both. `content` excludes the leading marker character but
/// is otherwise byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Line {
    pub kind: LineKind,
    pub content: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

/// One `@@` hunk block: declared ranges plus the lines belonging to it.
///
/// Ranges are 1-based and inclusive; a zero-length range on one side is a
/// pure insertion or deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hunk {
    /// The raw `@@ -old_start,old_lines +new_start,new_lines @@` header line.
    pub header: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<Line>,
}

/// All hunks touching one file within a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    /// Post-image path (old path for deletions), `a/`/`b/` prefixes stripped.
    pub path: String,
    pub hunks: Vec<Hunk>,
}

/// One immutable diff snapshot within a change's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub files: Vec<FileDiff>,
}

impl Revision {
    /// Looks up the file entry for `path`, if the revision touches it.
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Rejection reasons for unparsable diff input.
///
/// Raised at ingestion time only; the owning change is left at its prior
/// revision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedDiffError {
    #[error("line {line}: unparsable hunk header `{header}`")]
    BadHunkHeader { line: usize, header: String },
    #[error("line {line}: hunk body inconsistent with declared ranges")]
    RangeMismatch { line: usize },
    #[error("line {line}: hunk header before any file header")]
    HunkOutsideFile { line: usize },
    #[error("diff ends inside a hunk")]
    Truncated,
}

/// Strips the conventional `a/` / `b/` prefix from a diff header path.
///
/// Also trims a trailing tab-separated timestamp, which some diff tools
/// append after the path.
fn header_path(raw: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw);
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_owned()
}

/// Parses `-a[,b] +c[,d]` out of a hunk header line, or `None`.
fn parse_hunk_ranges(line: &str) -> Option<(u32, u32, u32, u32)> {
    let rest = line.strip_prefix("@@ -")?;
    let (old_part, rest) = rest.split_once(" +")?;
    let (new_part, _) = rest.split_once(" @@")?;
    let (old_start, old_lines) = parse_range(old_part)?;
    let (new_start, new_lines) = parse_range(new_part)?;
    Some((old_start, old_lines, new_start, new_lines))
}

/// Parses `start[,len]`; a missing length means 1 per diff convention.
fn parse_range(s: &str) -> Option<(u32, u32)> {
    match s.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

/// Appends a line to the currently open hunk.
///
/// Only called while a hunk is open, which guarantees a current file and hunk.
fn push_line(files: &mut [FileDiff], line: Line) {
    if let Some(h) = files.last_mut().and_then(|f| f.hunks.last_mut()) {
        h.lines.push(line);
    }
}

/// Parses raw unified diff text into a [`Revision`].
///
/// Accepts both plain unified diffs and git-style diffs (`diff --git`,
/// `index`, mode, rename, and binary header lines are skipped). Lines
/// outside any hunk that are not recognized headers are treated as
/// preamble and ignored; inside a hunk every line must be accounted for by
/// the declared ranges.
///
/// # Errors
///
/// Returns [`MalformedDiffError`] on an unparsable `@@` header, a hunk
/// body that disagrees with its declared ranges, a hunk before any file
/// header, or input that ends mid-hunk.
pub fn parse(raw: &str) -> Result<Revision, MalformedDiffError> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut pending_old_path: Option<String> = None;
    let mut in_file = false;

    // Hunk cursor: lines remaining per side and the next line number per side.
    let mut old_rem: u32 = 0;
    let mut new_rem: u32 = 0;
    let mut old_no: u32 = 0;
    let mut new_no: u32 = 0;

    for (i, line) in raw.lines().enumerate() {
        let lineno = i + 1;

        if old_rem > 0 || new_rem > 0 {
            if let Some(rest) = line.strip_prefix('+') {
                if new_rem == 0 {
                    return Err(MalformedDiffError::RangeMismatch { line: lineno });
                }
                push_line(&mut files, Line {
                    kind: LineKind::Added,
                    content: rest.to_owned(),
                    old_line: None,
                    new_line: Some(new_no),
                });
                new_no += 1;
                new_rem -= 1;
            } else if let Some(rest) = line.strip_prefix('-') {
                if old_rem == 0 {
                    return Err(MalformedDiffError::RangeMismatch { line: lineno });
                }
                push_line(&mut files, Line {
                    kind: LineKind::Removed,
                    content: rest.to_owned(),
                    old_line: Some(old_no),
                    new_line: None,
                });
                old_no += 1;
                old_rem -= 1;
            } else if line.starts_with('\\') {
                // "\ No newline at end of file" qualifies the previous line.
            } else if let Some(rest) = line.strip_prefix(' ').or(if line.is_empty() {
                // Some tools strip the single space from blank context lines.
                Some("")
            } else {
                None
            }) {
                if old_rem == 0 || new_rem == 0 {
                    return Err(MalformedDiffError::RangeMismatch { line: lineno });
                }
                push_line(&mut files, Line {
                    kind: LineKind::Context,
                    content: rest.to_owned(),
                    old_line: Some(old_no),
                    new_line: Some(new_no),
                });
                old_no += 1;
                new_no += 1;
                old_rem -= 1;
                new_rem -= 1;
            } else {
                return Err(MalformedDiffError::RangeMismatch { line: lineno });
            }
            continue;
        }

        if line.starts_with("diff --git ") {
            pending_old_path = None;
            in_file = false;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            pending_old_path = Some(header_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let new_path = header_path(rest);
            let path = if new_path == "/dev/null" {
                pending_old_path.take().unwrap_or(new_path)
            } else {
                new_path
            };
            files.push(FileDiff { path, hunks: Vec::new() });
            in_file = true;
        } else if line.starts_with("@@") {
            let (old_start, old_lines, new_start, new_lines) = parse_hunk_ranges(line)
                .ok_or_else(|| MalformedDiffError::BadHunkHeader {
                    line: lineno,
                    header: line.to_owned(),
                })?;
            if !in_file {
                return Err(MalformedDiffError::HunkOutsideFile { line: lineno });
            }
            if let Some(f) = files.last_mut() {
                f.hunks.push(Hunk {
                    header: line.to_owned(),
                    old_start,
                    old_lines,
                    new_start,
                    new_lines,
                    lines: Vec::new(),
                });
            }
            old_rem = old_lines;
            new_rem = new_lines;
            old_no = old_start;
            new_no = new_start;
        } else if in_file
            && !line.is_empty()
            && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
        {
            // A body line past the declared ranges of the last hunk.
            return Err(MalformedDiffError::RangeMismatch { line: lineno });
        }
        // Anything else outside a hunk (index/mode/rename/binary headers,
        // preamble text, blank separators) is skipped.
    }

    if old_rem > 0 || new_rem > 0 {
        return Err(MalformedDiffError::Truncated);
    }

    Ok(Revision { files })
}
