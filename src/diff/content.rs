//! Content diff for the changed elements of a snapshot.
//!
//! Line-based unified diffs between the two most recent content versions
//! of each element the normalization pass flagged as changed.

use std::collections::BTreeMap;

use similar::TextDiff;
use tracing::{debug, info};

use super::DiffError;
use crate::models::ElementContent;
use crate::repository::{format_version, VersionStore};

/// Unified line diff between two content versions of one element.
///
/// Headers carry the element id and the version each side was observed
/// at, `element_<id>@<version>`.
pub fn unified_content_diff(old: &ElementContent, new: &ElementContent) -> String {
    TextDiff::from_lines(&old.content_raw, &new.content_raw)
        .unified_diff()
        .header(
            &format!("element_{}@{}", old.element_id, format_version(&old.version)),
            &format!("element_{}@{}", new.element_id, format_version(&new.version)),
        )
        .to_string()
}

/// Content diff job for one snapshot.
///
/// For each changed element, diffs its two most recent content versions.
/// An element with fewer than two versions was created during the pass
/// and has nothing to compare, so it is skipped. Writes the id-to-diff
/// mapping and attempts the finish convergence.
pub fn run(store: &VersionStore, snapshot_id: &str) -> Result<(), DiffError> {
    let snapshot = store
        .get_snapshot(snapshot_id)?
        .ok_or_else(|| DiffError::SnapshotNotFound(snapshot_id.to_string()))?;
    let changed = snapshot
        .changed_elements
        .ok_or_else(|| DiffError::MissingResult(snapshot_id.to_string()))?;

    let mut diffs: BTreeMap<String, String> = BTreeMap::new();
    for element_id in &changed {
        let contents = store.latest_contents(element_id, 2)?;
        if contents.len() < 2 {
            debug!(
                element_id,
                versions = contents.len(),
                "not enough versions to diff, skipping"
            );
            continue;
        }
        diffs.insert(
            element_id.clone(),
            unified_content_diff(&contents[1], &contents[0]),
        );
    }
    info!(snapshot_id, elements = diffs.len(), "content diff computed");

    store.set_content_diff(snapshot_id, &serde_json::to_value(&diffs)?)?;
    if store.try_finish(snapshot_id)? {
        debug!(snapshot_id, "snapshot finished");
    }
    Ok(())
}
