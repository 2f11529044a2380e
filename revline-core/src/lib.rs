//! revline-core — shared records and storage for the review session engine.
//!
//! This crate owns the domain records (changes, revisions, annotations,
//! review sessions, score events), the WAL-mode SQLite schema, and the
//! [`store::ChangeStore`] repository seam the engine mutates through. It
//! contains no review semantics: diff parsing, anchor resolution, state
//! transitions, and scoring all live in the `revline` crate.

pub mod db;
pub mod schema;
pub mod store;
pub mod types;
