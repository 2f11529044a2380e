//! revline — a review session engine.
//!
//! Ingests version-control diffs, maintains an addressable annotation
//! layer over them, relocates annotations across revisions by content
//! anchors, drives the review lifecycle state machine, and folds reviewer
//! activity into an append-only, anti-gaming score log.
//!
//! The flow for one change: a revision arrives ([`diff`] parses it), every
//! active annotation is re-anchored against it ([`anchor`],
//! [`annotations`]), the state machine re-evaluates ([`state`]), and
//! qualifying activity lands in the score log ([`scoring`]) — all under a
//! per-change lock and one atomic store commit ([`engine`]). Persistence
//! lives behind the `revline-core` repository seam; the version-control
//! host and identity collaborators are the traits in [`host`]; outbound
//! events flow through [`notify`].

pub mod anchor;
pub mod annotations;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod host;
pub mod notify;
pub mod scoring;
pub mod state;

pub use config::Config;
pub use engine::{AnnotatedDiff, IngestSummary, ReviewEngine};
pub use error::{EngineError, Result};
pub use notify::Notification;
pub use scoring::Window;
