//! strata: a versioned store for hierarchical documents.
//!
//! Documents are ingested from an external block-based source, normalized
//! into elements with append-only metadata and content versions, and
//! diffed against their previous observation. Processing is driven by a
//! snapshot state machine backed by a SQLite job queue.

pub mod cli;
pub mod config;
pub mod diff;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod server;
pub mod source;
