//! Snapshot model and processing state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StructureNode;

/// Processing status of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Open,
    Pending,
    ProcessingDiffs,
    Done,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::ProcessingDiffs => "processing_diffs",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "pending" => Some(Self::Pending),
            "processing_diffs" => Some(Self::ProcessingDiffs),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// True if the snapshot will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One observed pass over a document.
///
/// A snapshot is created `open`, moves to `pending` when dispatched, and
/// terminates in `done` or `error`. Updates with content changes pass
/// through `processing_diffs` while the two diff jobs fill in
/// `structure_diff` and `changed_elements_diff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique identifier for this snapshot.
    pub id: String,
    /// Owning document; None until the reference has been resolved.
    pub document_id: Option<String>,
    /// External reference id this snapshot was requested for.
    pub reference_id: String,
    /// When the snapshot was requested.
    pub triggered_at: DateTime<Utc>,
    /// When normalization started.
    pub executed_at: Option<DateTime<Utc>>,
    /// When processing fully finished.
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SnapshotStatus,
    /// Nested element structure observed by this pass.
    pub structure: Option<Vec<StructureNode>>,
    /// Structure diff summary against the previous snapshot.
    pub structure_diff: Option<serde_json::Value>,
    /// Ids of elements whose content changed in this pass.
    pub changed_elements: Option<Vec<String>>,
    /// Per-element unified diffs, keyed by element id.
    pub changed_elements_diff: Option<serde_json::Value>,
    /// Human-readable failure message, if processing failed.
    pub error: Option<String>,
}

impl Snapshot {
    /// Create a new open snapshot for a reference.
    pub fn new(reference_id: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: None,
            reference_id,
            triggered_at: Utc::now(),
            executed_at: None,
            finished_at: None,
            status: SnapshotStatus::Open,
            structure: None,
            structure_diff: None,
            changed_elements: None,
            changed_elements_diff: None,
            error: None,
        }
    }
}
