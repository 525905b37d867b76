//! Document and element models for hierarchical document versioning.
//!
//! Elements are stored with content-addressable versioning, allowing
//! detection of changes when documents are re-ingested from their source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A tracked hierarchical document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier for this document.
    pub id: String,
    /// External reference id (the root block id at the source).
    pub reference_id: String,
    /// Canonical URL for this document at the source.
    pub url: String,
    /// Document title as reported by the source.
    pub title: String,
    /// Source-reported document kind.
    pub document_type: String,
    /// When the document was first seen.
    pub created_at: DateTime<Utc>,
    /// When the document was last modified.
    pub updated_at: DateTime<Utc>,
    /// Whether the document is still tracked.
    pub is_active: bool,
}

impl Document {
    /// Create a new document for a source reference.
    pub fn new(reference_id: String, url: String, title: String, document_type: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reference_id,
            url,
            title,
            document_type,
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }
}

/// A single element (block) of a document.
///
/// The element row itself is mutable only in its cached version pointers;
/// all observed states live in append-only metadata and content version
/// rows keyed by `(element_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentElement {
    /// Stable external block id.
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Block type as reported by the source (paragraph, heading, ...).
    pub element_type: String,
    /// Version of the newest metadata row, if any.
    pub latest_metadata_version: Option<DateTime<Utc>>,
    /// Version of the newest content row, if any.
    pub latest_content_version: Option<DateTime<Utc>>,
    /// Content hash of the newest content row, if any.
    pub latest_content_hash: Option<String>,
}

impl DocumentElement {
    /// Create a new element with no versions yet.
    pub fn new(id: String, document_id: String, element_type: String) -> Self {
        Self {
            id,
            document_id,
            element_type,
            latest_metadata_version: None,
            latest_content_version: None,
            latest_content_hash: None,
        }
    }
}

/// One immutable positional state of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementMetadata {
    pub element_id: String,
    /// Snapshot timestamp this state was observed at.
    pub version: DateTime<Utc>,
    /// Nesting depth; 0 for top-level elements.
    pub level: i64,
    /// Pre-order position within the flattened document.
    pub position: i64,
    /// Parent element id; None for top-level elements.
    pub parent_element: Option<String>,
    /// Previous sibling, if any.
    pub predecessor: Option<String>,
    /// Next sibling, if any.
    pub successor: Option<String>,
}

impl ElementMetadata {
    /// True if the two states describe the same placement in the tree.
    pub fn same_placement(&self, other: &ElementMetadata) -> bool {
        self.level == other.level
            && self.position == other.position
            && self.parent_element == other.parent_element
    }
}

/// One immutable content state of an element.
///
/// Content is identified by a SHA-256 hash over the plain text only, so
/// structural moves and formatting changes never register as new content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementContent {
    pub element_id: String,
    /// Snapshot timestamp this content was observed at.
    pub version: DateTime<Utc>,
    /// Plain text of the element.
    pub content_raw: String,
    /// Formatted rendition of the element, if the source provides one.
    pub content_formatted: Option<String>,
    /// SHA-256 of `content_raw`.
    pub hash_raw: String,
}

impl ElementContent {
    /// Compute the SHA-256 hash of element plain text.
    pub fn compute_hash(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Create a content state for an element at a given snapshot version.
    pub fn new(
        element_id: String,
        version: DateTime<Utc>,
        content_raw: String,
        content_formatted: Option<String>,
    ) -> Self {
        let hash_raw = Self::compute_hash(&content_raw);
        Self {
            element_id,
            version,
            content_raw,
            content_formatted,
            hash_raw,
        }
    }
}
