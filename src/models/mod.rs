//! Data models for the versioned document store.

mod document;
mod snapshot;
mod structure;

pub use document::{Document, DocumentElement, ElementContent, ElementMetadata};
pub use snapshot::{Snapshot, SnapshotStatus};
pub use structure::{flatten, rebuild, FlatEntry, StructureNode};
