//! Diff jobs over recorded snapshots.
//!
//! Both jobs read their input from the snapshot row, write their result
//! into their own column, and then attempt the `processing_diffs -> done`
//! convergence. Each is idempotent; re-running overwrites its own output.

pub mod content;
pub mod structure;

use crate::repository::StoreError;

/// Errors from the diff jobs.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),
    #[error("snapshot {0} has no recorded normalization result")]
    MissingResult(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
