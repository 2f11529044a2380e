//! Working-set operations over one change's annotations.
//!
//! Annotations are keyed by UUID v4 text, assigned at creation and stable
//! for the life of the change. Creation is commutative across concurrent
//! reviewers — no shared counter is involved. `reanchor_all` is the pure
//! batch half of revision ingestion: it computes one update per active
//! annotation and the engine commits the whole batch atomically, so a
//! partially re-anchored change is never observable.

use uuid::Uuid;

use revline_core::store::AnnotationUpdate;
use revline_core::types::{Anchor, Annotation, AnnotationKind, AnnotationStatus};

use crate::anchor::{self, AnchorConfig, Resolution};
use crate::diff::Revision;

/// Builds a fresh active annotation.
pub fn build(
    change_id: &str,
    author_id: &str,
    kind: AnnotationKind,
    body: String,
    patch: Option<String>,
    anchor: Anchor,
    created_revision: u32,
    now: i64,
) -> Annotation {
    Annotation {
        id: Uuid::new_v4().to_string(),
        change_id: change_id.to_owned(),
        author_id: author_id.to_owned(),
        kind,
        status: AnnotationStatus::Active,
        body,
        patch,
        anchor,
        created_revision,
        orphan_reason: None,
        supersedes: None,
        created_at: now,
        resolved_at: None,
        replies: Vec::new(),
    }
}

/// Looks up an annotation by id within a change's working set.
pub fn find<'a>(annotations: &'a [Annotation], id: &str) -> Option<&'a Annotation> {
    annotations.iter().find(|a| a.id == id)
}

/// Re-anchors every *active* annotation against a new revision.
///
/// Located anchors keep their status and take the relocated line as the new
/// last-known position; failures become `Orphaned` with their reason, line
/// unchanged. Resolved and already-orphaned annotations are left alone —
/// status never moves backward automatically.
///
/// Deterministic in its inputs: running it twice against the same revision
/// with no intervening mutation yields identical updates.
pub fn reanchor_all(
    annotations: &[Annotation],
    rev: &Revision,
    cfg: &AnchorConfig,
) -> Vec<AnnotationUpdate> {
    annotations
        .iter()
        .filter(|a| a.status == AnnotationStatus::Active)
        .map(|a| match anchor::resolve(&a.anchor, rev, cfg) {
            Resolution::Located { line, .. } => AnnotationUpdate {
                id: a.id.clone(),
                status: AnnotationStatus::Active,
                orphan_reason: None,
                line,
            },
            Resolution::Orphaned(reason) => AnnotationUpdate {
                id: a.id.clone(),
                status: AnnotationStatus::Orphaned,
                orphan_reason: Some(reason),
                line: a.anchor.line,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse;
    use revline_core::types::{OrphanReason, Side};

    const REV1: &str = "\
--- a/src/calc.rs
+++ b/src/calc.rs
@@ -8,4 +8,4 @@
 fn total(x: u32) -> u32 {
-    x + 1
+    x + 2
     return x
 }
";

    const REV2: &str = "\
--- a/src/calc.rs
+++ b/src/calc.rs
@@ -12,4 +12,4 @@
 fn total(x: u32) -> u32 {
-    x + 2
+    x + 3
     return x
 }
";

    fn annotation_at(rev: &Revision, line: u32) -> Annotation {
        let anchor =
            anchor::anchor_at(rev, "src/calc.rs", Side::New, line, &AnchorConfig::default())
                .unwrap();
        build(
            "c1",
            "bob",
            AnnotationKind::Comment,
            "prefer an explicit width here".to_owned(),
            None,
            anchor,
            0,
            100,
        )
    }

    fn apply(a: &Annotation, u: &AnnotationUpdate) -> Annotation {
        let mut a = a.clone();
        a.status = u.status;
        a.orphan_reason = u.orphan_reason;
        a.anchor.line = u.line;
        a
    }

    #[test]
    fn ids_are_unique_and_stable() {
        let rev = parse(REV1).unwrap();
        let a = annotation_at(&rev, 10);
        let b = annotation_at(&rev, 10);
        assert_ne!(a.id, b.id, "concurrent creations must not collide");

        let rev2 = parse(REV2).unwrap();
        let updates = reanchor_all(&[a.clone()], &rev2, &AnchorConfig::default());
        assert_eq!(updates[0].id, a.id, "re-anchoring never renames");
    }

    #[test]
    fn located_annotation_takes_new_line() {
        let rev1 = parse(REV1).unwrap();
        let rev2 = parse(REV2).unwrap();
        let a = annotation_at(&rev1, 10);
        let updates = reanchor_all(&[a], &rev2, &AnchorConfig::default());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, AnnotationStatus::Active);
        assert_eq!(updates[0].line, 14);
    }

    #[test]
    fn missing_content_orphans_with_reason() {
        let rev1 = parse(REV1).unwrap();
        let gone = parse("--- a/other.rs\n+++ b/other.rs\n@@ -1 +1 @@\n-a\n+b\n").unwrap();
        let a = annotation_at(&rev1, 10);
        let updates = reanchor_all(std::slice::from_ref(&a), &gone, &AnchorConfig::default());
        assert_eq!(updates[0].status, AnnotationStatus::Orphaned);
        assert_eq!(updates[0].orphan_reason, Some(OrphanReason::ContentNotFound));
        assert_eq!(updates[0].line, a.anchor.line, "orphans keep their last line");
    }

    #[test]
    fn non_active_annotations_are_skipped() {
        let rev1 = parse(REV1).unwrap();
        let rev2 = parse(REV2).unwrap();
        let mut resolved = annotation_at(&rev1, 10);
        resolved.status = AnnotationStatus::Resolved;
        let mut orphaned = annotation_at(&rev1, 10);
        orphaned.status = AnnotationStatus::Orphaned;
        orphaned.orphan_reason = Some(OrphanReason::ContentNotFound);
        let updates = reanchor_all(&[resolved, orphaned], &rev2, &AnchorConfig::default());
        assert!(updates.is_empty(), "status never moves backward automatically");
    }

    #[test]
    fn reanchoring_twice_is_idempotent() {
        let rev1 = parse(REV1).unwrap();
        let rev2 = parse(REV2).unwrap();
        let cfg = AnchorConfig::default();
        let a = annotation_at(&rev1, 10);

        let first = reanchor_all(std::slice::from_ref(&a), &rev2, &cfg);
        let after_first = apply(&a, &first[0]);
        let second = reanchor_all(std::slice::from_ref(&after_first), &rev2, &cfg);

        assert_eq!(first[0].status, second[0].status);
        assert_eq!(first[0].line, second[0].line);
        assert_eq!(first[0].orphan_reason, second[0].orphan_reason);
    }
}
