//! Structure diff between a snapshot and its predecessor.
//!
//! Compares the recorded `{id: [children]}` forests by element id, never
//! by re-sorting content. An id present only in the new forest is an
//! insertion, only in the old one a deletion; an id in both whose parent
//! changed is a hierarchy move, and one whose rank among siblings changed
//! under the same parent is a reorder. Moves are classified, never
//! reported as delete plus insert.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::DiffError;
use crate::models::{flatten, FlatEntry, StructureNode};
use crate::repository::VersionStore;

/// Summary written onto the snapshot's structure diff column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDiff {
    /// Flattened element count of the previous structure.
    pub old_elements_count: usize,
    /// Flattened element count of the new structure.
    pub new_elements_count: usize,
    pub inserted: Vec<String>,
    pub deleted: Vec<String>,
    pub moved: Vec<Move>,
}

impl StructureDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.moved.is_empty()
    }
}

/// One element that exists in both structures but sits elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub id: String,
    pub kind: MoveKind,
    pub old_parent: Option<String>,
    pub new_parent: Option<String>,
    /// Rank among siblings in the old structure.
    pub old_position: usize,
    /// Rank among siblings in the new structure.
    pub new_position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    /// The element changed parents.
    Hierarchy,
    /// The element changed rank under the same parent.
    Reorder,
}

/// Diff two structure forests.
///
/// Positions compare as sibling ranks, so an insertion does not register
/// a move for every element after it in document order, only for the
/// siblings it actually displaced.
pub fn diff_forests(old: &[StructureNode], new: &[StructureNode]) -> StructureDiff {
    let old_flat = flatten(old);
    let new_flat = flatten(new);

    let old_by_id: HashMap<&str, &FlatEntry> =
        old_flat.iter().map(|e| (e.id.as_str(), e)).collect();
    let new_by_id: HashMap<&str, &FlatEntry> =
        new_flat.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut inserted = Vec::new();
    let mut moved = Vec::new();
    for entry in &new_flat {
        match old_by_id.get(entry.id.as_str()) {
            None => inserted.push(entry.id.clone()),
            Some(old_entry) => {
                let kind = if old_entry.parent != entry.parent {
                    MoveKind::Hierarchy
                } else if old_entry.position != entry.position {
                    MoveKind::Reorder
                } else {
                    continue;
                };
                moved.push(Move {
                    id: entry.id.clone(),
                    kind,
                    old_parent: old_entry.parent.clone(),
                    new_parent: entry.parent.clone(),
                    old_position: old_entry.position,
                    new_position: entry.position,
                });
            }
        }
    }

    let deleted = old_flat
        .iter()
        .filter(|e| !new_by_id.contains_key(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();

    StructureDiff {
        old_elements_count: old_flat.len(),
        new_elements_count: new_flat.len(),
        inserted,
        deleted,
        moved,
    }
}

/// Structure diff job for one snapshot.
///
/// Reads the structure recorded on the snapshot, compares it with the
/// immediately preceding snapshot of the same document, writes the
/// summary, and attempts the finish convergence.
pub fn run(store: &VersionStore, snapshot_id: &str) -> Result<(), DiffError> {
    let snapshot = store
        .get_snapshot(snapshot_id)?
        .ok_or_else(|| DiffError::SnapshotNotFound(snapshot_id.to_string()))?;
    let document_id = snapshot
        .document_id
        .as_deref()
        .ok_or_else(|| DiffError::MissingResult(snapshot_id.to_string()))?;
    let new_structure = snapshot
        .structure
        .as_deref()
        .ok_or_else(|| DiffError::MissingResult(snapshot_id.to_string()))?;

    let old_structure = match store.previous_snapshot(document_id, snapshot.triggered_at)? {
        Some(previous) => previous.structure.unwrap_or_default(),
        None => {
            warn!(snapshot_id, "no previous structure, diffing against empty");
            Vec::new()
        }
    };

    let diff = diff_forests(&old_structure, new_structure);
    info!(
        snapshot_id,
        inserted = diff.inserted.len(),
        deleted = diff.deleted.len(),
        moved = diff.moved.len(),
        "structure diff computed"
    );

    store.set_structure_diff(snapshot_id, &serde_json::to_value(&diff)?)?;
    if store.try_finish(snapshot_id)? {
        debug!(snapshot_id, "snapshot finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> StructureNode {
        StructureNode::new(id)
    }

    fn parent(id: &str, children: Vec<StructureNode>) -> StructureNode {
        StructureNode::with_children(id, children)
    }

    #[test]
    fn test_identical_forests_yield_empty_diff() {
        let forest = vec![parent("a", vec![node("a1")]), node("b")];
        let diff = diff_forests(&forest, &forest);
        assert!(diff.is_empty());
        assert_eq!(diff.old_elements_count, 3);
        assert_eq!(diff.new_elements_count, 3);
    }

    #[test]
    fn test_insert_and_delete() {
        let old = vec![node("a"), node("b")];
        let new = vec![node("a"), node("c")];
        let diff = diff_forests(&old, &new);
        assert_eq!(diff.inserted, vec!["c".to_string()]);
        assert_eq!(diff.deleted, vec!["b".to_string()]);
        // "c" takes "b"'s rank, so "a" did not move
        assert!(diff.moved.is_empty());
    }

    #[test]
    fn test_reparent_is_a_single_hierarchy_move() {
        // "x" moves from the end of "a" to the end of "b"
        let old = vec![
            parent("a", vec![node("a1"), node("x")]),
            parent("b", vec![node("b1")]),
        ];
        let new = vec![
            parent("a", vec![node("a1")]),
            parent("b", vec![node("b1"), node("x")]),
        ];
        let diff = diff_forests(&old, &new);
        assert!(diff.inserted.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.moved.len(), 1);

        let mv = &diff.moved[0];
        assert_eq!(mv.id, "x");
        assert_eq!(mv.kind, MoveKind::Hierarchy);
        assert_eq!(mv.old_parent.as_deref(), Some("a"));
        assert_eq!(mv.new_parent.as_deref(), Some("b"));
    }

    #[test]
    fn test_sibling_swap_is_two_reorders() {
        let old = vec![node("a"), node("b")];
        let new = vec![node("b"), node("a")];
        let diff = diff_forests(&old, &new);
        assert!(diff.inserted.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.moved.len(), 2);
        assert!(diff.moved.iter().all(|m| m.kind == MoveKind::Reorder));
    }

    #[test]
    fn test_top_insertion_does_not_move_descendants() {
        let old = vec![parent("a", vec![node("a1"), node("a2")]), node("b")];
        let new = vec![
            node("new"),
            parent("a", vec![node("a1"), node("a2")]),
            node("b"),
        ];
        let diff = diff_forests(&old, &new);
        assert_eq!(diff.inserted, vec!["new".to_string()]);

        // only the displaced top-level siblings register as reorders;
        // nested elements keep their sibling rank
        let moved_ids: Vec<&str> = diff.moved.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(moved_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_diff_against_empty_is_all_insertions() {
        let new = vec![parent("a", vec![node("a1")])];
        let diff = diff_forests(&[], &new);
        assert_eq!(diff.old_elements_count, 0);
        assert_eq!(diff.inserted.len(), 2);
        assert!(diff.deleted.is_empty());
        assert!(diff.moved.is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let old = vec![node("a")];
        let new = vec![node("a"), node("b")];
        let value = serde_json::to_value(diff_forests(&old, &new)).unwrap();
        assert_eq!(value["old_elements_count"], 1);
        assert_eq!(value["new_elements_count"], 2);
        assert_eq!(value["inserted"], serde_json::json!(["b"]));
    }
}
