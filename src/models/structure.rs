//! Nested element structure recorded on snapshots.
//!
//! The wire and storage shape is a forest of single-key maps,
//! `[{"<element-id>": [<children>]}]`, matching what the source API
//! reports. `StructureNode` keeps that shape through serde while giving
//! the diff engine a typed tree to work with.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One node of the recorded document structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureNode {
    pub id: String,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(id: impl Into<String>, children: Vec<StructureNode>) -> Self {
        Self {
            id: id.into(),
            children,
        }
    }

    /// Total number of nodes in this subtree, including self.
    pub fn subtree_size(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(StructureNode::subtree_size)
            .sum::<usize>()
    }
}

impl Serialize for StructureNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.id, &self.children)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for StructureNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = StructureNode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-key map of element id to children")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let (id, children): (String, Vec<StructureNode>) = access
                    .next_entry()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                if access.next_entry::<String, Vec<StructureNode>>()?.is_some() {
                    return Err(serde::de::Error::invalid_length(2, &self));
                }
                Ok(StructureNode { id, children })
            }
        }

        deserializer.deserialize_map(NodeVisitor)
    }
}

/// Flattened placement of one element: its parent and its rank among
/// siblings. Parent is None for top-level elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub id: String,
    pub parent: Option<String>,
    pub position: usize,
}

/// Flatten a structure forest into pre-order `(id, parent, position)`
/// entries. Position is the rank among siblings, not a global index, so
/// an insertion near the top of the document does not shift the recorded
/// placement of every later element.
pub fn flatten(forest: &[StructureNode]) -> Vec<FlatEntry> {
    let mut out = Vec::new();
    flatten_level(forest, None, &mut out);
    out
}

fn flatten_level(nodes: &[StructureNode], parent: Option<&str>, out: &mut Vec<FlatEntry>) {
    for (position, node) in nodes.iter().enumerate() {
        out.push(FlatEntry {
            id: node.id.clone(),
            parent: parent.map(|p| p.to_string()),
            position,
        });
        flatten_level(&node.children, Some(&node.id), out);
    }
}

/// Rebuild a structure forest from flattened entries.
///
/// Inverse of [`flatten`] for any well-formed input: children are grouped
/// under their parent and ordered by position; entries without a parent
/// become roots.
pub fn rebuild(entries: &[FlatEntry]) -> Vec<StructureNode> {
    let mut by_parent: BTreeMap<Option<String>, Vec<&FlatEntry>> = BTreeMap::new();
    for entry in entries {
        by_parent.entry(entry.parent.clone()).or_default().push(entry);
    }
    for children in by_parent.values_mut() {
        children.sort_by_key(|e| e.position);
    }
    build_level(&None, &by_parent)
}

fn build_level(
    parent: &Option<String>,
    by_parent: &BTreeMap<Option<String>, Vec<&FlatEntry>>,
) -> Vec<StructureNode> {
    by_parent
        .get(parent)
        .map(|children| {
            children
                .iter()
                .map(|entry| StructureNode {
                    id: entry.id.clone(),
                    children: build_level(&Some(entry.id.clone()), by_parent),
                })
                .collect()
        })
        .unwrap_or_default()
}
