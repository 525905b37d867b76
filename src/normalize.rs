//! Normalization of an external block tree into the versioned store.
//!
//! A pass runs in two phases. The fetch phase walks the source tree
//! depth-first and extracts text, placement and sibling links for every
//! block. The persist phase replays that flat list against the store in
//! one transaction: new elements get their initial versions, content
//! changes append a content version, placement changes append a metadata
//! version, and everything else writes nothing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::models::{Document, DocumentElement, ElementContent, ElementMetadata, StructureNode};
use crate::repository::{StoreError, VersionStore};
use crate::source::{Block, BlockSource, RootInfo, SourceError};

const DOCUMENT_TYPE: &str = "external_page";

/// Errors from a normalization pass.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a completed pass.
#[derive(Debug)]
pub struct NormalizeOutcome {
    pub document_id: String,
    /// False when this pass created the document.
    pub is_update: bool,
    /// Nested structure observed during the pass.
    pub structure: Vec<StructureNode>,
    /// Elements whose content hash changed, in traversal order.
    pub changed_elements: Vec<String>,
}

/// One visited block with its placement in the tree.
struct VisitedBlock {
    block: Block,
    level: i64,
    position: i64,
    parent: Option<String>,
    predecessor: Option<String>,
    successor: Option<String>,
}

/// Walks an external document and records it in the store.
pub struct Normalizer {
    store: VersionStore,
    max_retries: u32,
    retry_base: Duration,
}

impl Normalizer {
    pub fn new(store: VersionStore) -> Self {
        Self {
            store,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
        }
    }

    /// Override how transient source errors are retried during fetch.
    pub fn with_retry_policy(mut self, max_retries: u32, retry_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = retry_base;
        self
    }

    /// Run one full pass for a reference and record the result on the
    /// snapshot row. The caller decides the snapshot's status from the
    /// returned outcome.
    pub async fn run(
        &self,
        source: &dyn BlockSource,
        reference_id: &str,
        snapshot_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<NormalizeOutcome, NormalizeError> {
        let root = self.root_with_retry(source, reference_id).await?;

        let mut visited = Vec::new();
        let mut position = 0i64;
        let structure = self
            .walk(source, reference_id, 0, &mut position, None, &mut visited)
            .await?;
        info!(
            reference_id,
            elements = visited.len(),
            "fetched document tree"
        );

        self.persist(snapshot_id, reference_id, &root, structure, visited, observed_at)
    }

    async fn root_with_retry(
        &self,
        source: &dyn BlockSource,
        reference_id: &str,
    ) -> Result<RootInfo, SourceError> {
        let mut attempt = 0;
        loop {
            match source.get_root(reference_id).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(reference_id, attempt, error = %e, "retrying root fetch");
                    tokio::time::sleep(self.retry_base * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn children_with_retry(
        &self,
        source: &dyn BlockSource,
        block_id: &str,
    ) -> Result<Vec<Block>, SourceError> {
        let mut attempt = 0;
        loop {
            match source.get_children(block_id).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(block_id, attempt, error = %e, "retrying child listing");
                    tokio::time::sleep(self.retry_base * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Depth-first traversal. `position` is a pre-order index over the
    /// whole flattened tree, so descendants consume slots before the
    /// parent's next sibling.
    fn walk<'a>(
        &'a self,
        source: &'a dyn BlockSource,
        block_id: &'a str,
        level: i64,
        position: &'a mut i64,
        parent: Option<&'a str>,
        out: &'a mut Vec<VisitedBlock>,
    ) -> BoxFuture<'a, Result<Vec<StructureNode>, SourceError>> {
        Box::pin(async move {
            let children = self.children_with_retry(source, block_id).await?;
            debug!(block_id, count = children.len(), "listed children");

            let sibling_ids: Vec<String> = children.iter().map(|b| b.id.clone()).collect();
            let mut structure = Vec::with_capacity(children.len());

            for (index, block) in children.into_iter().enumerate() {
                let own_position = *position;
                *position += 1;

                let id = block.id.clone();
                let has_children = block.has_children;
                out.push(VisitedBlock {
                    block,
                    level,
                    position: own_position,
                    parent: parent.map(str::to_string),
                    predecessor: index.checked_sub(1).map(|i| sibling_ids[i].clone()),
                    successor: sibling_ids.get(index + 1).cloned(),
                });

                let nested = if has_children {
                    self.walk(source, &id, level + 1, position, Some(&id), out)
                        .await?
                } else {
                    Vec::new()
                };
                structure.push(StructureNode::with_children(id, nested));
            }

            Ok(structure)
        })
    }

    /// Replay the visited blocks against the store in one transaction.
    fn persist(
        &self,
        snapshot_id: &str,
        reference_id: &str,
        root: &RootInfo,
        structure: Vec<StructureNode>,
        visited: Vec<VisitedBlock>,
        observed_at: DateTime<Utc>,
    ) -> Result<NormalizeOutcome, NormalizeError> {
        let tx = self.store.begin_ingest()?;

        let existing = tx.get_document_by_reference(reference_id)?;
        let is_update = existing.is_some();
        let document = match existing {
            Some(mut doc) => {
                doc.updated_at = observed_at;
                doc
            }
            None => Document::new(
                reference_id.to_string(),
                root.url.clone(),
                root.title.clone(),
                DOCUMENT_TYPE.to_string(),
            ),
        };
        tx.upsert_document(&document)?;

        let mut changed_elements = Vec::new();
        for node in visited {
            let metadata = ElementMetadata {
                element_id: node.block.id.clone(),
                version: observed_at,
                level: node.level,
                position: node.position,
                parent_element: node.parent,
                predecessor: node.predecessor,
                successor: node.successor,
            };

            match tx.get_element(&node.block.id)? {
                None => {
                    tx.insert_element(&DocumentElement::new(
                        node.block.id.clone(),
                        document.id.clone(),
                        node.block.block_type.clone(),
                    ))?;
                    tx.insert_metadata_version(&metadata)?;
                    tx.insert_content_version(&ElementContent::new(
                        node.block.id,
                        observed_at,
                        node.block.plain_text,
                        node.block.formatted_text,
                    ))?;
                }
                Some(element) => {
                    let hash = ElementContent::compute_hash(&node.block.plain_text);
                    if element.latest_content_hash.as_deref() != Some(hash.as_str()) {
                        changed_elements.push(node.block.id.clone());
                        tx.insert_content_version(&ElementContent::new(
                            node.block.id.clone(),
                            observed_at,
                            node.block.plain_text,
                            node.block.formatted_text,
                        ))?;
                    }

                    let placement_changed = tx
                        .current_metadata(&node.block.id)?
                        .map_or(true, |current| !current.same_placement(&metadata));
                    if placement_changed {
                        tx.insert_metadata_version(&metadata)?;
                    }
                }
            }
        }

        tx.record_snapshot_result(snapshot_id, &document.id, &structure, &changed_elements)?;
        tx.commit()?;

        info!(
            document_id = %document.id,
            is_update,
            changed = changed_elements.len(),
            "normalization pass committed"
        );

        Ok(NormalizeOutcome {
            document_id: document.id,
            is_update,
            structure,
            changed_elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Snapshot;
    use crate::source::MemoryBlockSource;

    fn test_store() -> (tempfile::TempDir, VersionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(&dir.path().join("strata.db")).unwrap();
        (dir, store)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// ref -> [a [b [d]], c]
    fn nested_source() -> MemoryBlockSource {
        let source = MemoryBlockSource::new("https://example.test/doc", "Doc");
        source.set_children(
            "ref",
            vec![
                MemoryBlockSource::parent_block("a", "alpha"),
                MemoryBlockSource::text_block("c", "gamma"),
            ],
        );
        source.set_children("a", vec![MemoryBlockSource::parent_block("b", "beta")]);
        source.set_children("b", vec![MemoryBlockSource::text_block("d", "delta")]);
        source
    }

    #[tokio::test]
    async fn test_first_pass_creates_document_and_versions() {
        let (_dir, store) = test_store();
        let source = nested_source();
        let snapshot = Snapshot::new("ref".to_string());
        store.insert_snapshot(&snapshot).unwrap();

        let outcome = Normalizer::new(store.clone())
            .run(&source, "ref", &snapshot.id, ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();

        assert!(!outcome.is_update);
        // new elements are not "changed"; the first pass has no baseline
        assert!(outcome.changed_elements.is_empty());

        let document = store.get_document_by_reference("ref").unwrap().unwrap();
        assert_eq!(document.title, "Doc");
        assert_eq!(document.id, outcome.document_id);

        let element = store.get_element("d").unwrap().unwrap();
        assert_eq!(element.document_id, document.id);
        assert!(element.latest_content_version.is_some());
        assert!(element.latest_metadata_version.is_some());

        let recorded = store.get_snapshot(&snapshot.id).unwrap().unwrap();
        assert_eq!(recorded.structure, Some(outcome.structure));
        assert_eq!(recorded.changed_elements, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_positions_are_global_preorder() {
        let (_dir, store) = test_store();
        let source = nested_source();

        let outcome = Normalizer::new(store.clone())
            .run(&source, "ref", "snap", ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();

        let placements = store
            .elements_with_placement(&outcome.document_id)
            .unwrap();
        let by_id: Vec<(String, i64, i64)> = placements
            .iter()
            .map(|(e, m)| (e.id.clone(), m.level, m.position))
            .collect();

        // descendants of "a" take slots 1 and 2, so "c" lands at 3
        assert!(by_id.contains(&("a".to_string(), 0, 0)));
        assert!(by_id.contains(&("b".to_string(), 1, 1)));
        assert!(by_id.contains(&("d".to_string(), 2, 2)));
        assert!(by_id.contains(&("c".to_string(), 0, 3)));
    }

    #[tokio::test]
    async fn test_unchanged_pass_writes_nothing() {
        let (_dir, store) = test_store();
        let source = nested_source();
        let normalizer = Normalizer::new(store.clone());

        normalizer
            .run(&source, "ref", "snap1", ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        let outcome = normalizer
            .run(&source, "ref", "snap2", ts("2024-01-02T10:00:00Z"))
            .await
            .unwrap();

        assert!(outcome.is_update);
        assert!(outcome.changed_elements.is_empty());

        // pointers still reference the first pass
        let element = store.get_element("a").unwrap().unwrap();
        assert_eq!(
            element.latest_content_version,
            Some(ts("2024-01-01T10:00:00Z"))
        );
        assert_eq!(store.latest_contents("a", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_content_change_appends_content_version_only() {
        let (_dir, store) = test_store();
        let source = nested_source();
        let normalizer = Normalizer::new(store.clone());

        normalizer
            .run(&source, "ref", "snap1", ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();

        source.set_children("b", vec![MemoryBlockSource::text_block("d", "delta two")]);
        let outcome = normalizer
            .run(&source, "ref", "snap2", ts("2024-01-02T10:00:00Z"))
            .await
            .unwrap();

        assert_eq!(outcome.changed_elements, vec!["d".to_string()]);

        let contents = store.latest_contents("d", 10).unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].content_raw, "delta two");

        // placement did not change, so no new metadata version
        let element = store.get_element("d").unwrap().unwrap();
        assert_eq!(
            element.latest_metadata_version,
            Some(ts("2024-01-01T10:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_reorder_appends_metadata_version_only() {
        let (_dir, store) = test_store();
        let source = nested_source();
        let normalizer = Normalizer::new(store.clone());

        normalizer
            .run(&source, "ref", "snap1", ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();

        // swap the top-level siblings
        source.set_children(
            "ref",
            vec![
                MemoryBlockSource::text_block("c", "gamma"),
                MemoryBlockSource::parent_block("a", "alpha"),
            ],
        );
        let outcome = normalizer
            .run(&source, "ref", "snap2", ts("2024-01-02T10:00:00Z"))
            .await
            .unwrap();

        // same text everywhere, so no content change registers
        assert!(outcome.changed_elements.is_empty());
        assert_eq!(store.latest_contents("c", 10).unwrap().len(), 1);

        let element = store.get_element("c").unwrap().unwrap();
        assert_eq!(
            element.latest_metadata_version,
            Some(ts("2024-01-02T10:00:00Z"))
        );
        let placements = store
            .elements_with_placement(&outcome.document_id)
            .unwrap();
        let (_, meta) = placements.iter().find(|(e, _)| e.id == "c").unwrap();
        assert_eq!(meta.position, 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_dir, store) = test_store();
        let source = nested_source();
        source.fail_children_times(2);

        let outcome = Normalizer::new(store)
            .with_retry_policy(3, Duration::from_millis(1))
            .run(&source, "ref", "snap", ts("2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome.structure.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_no_partial_state() {
        let (_dir, store) = test_store();
        let source = nested_source();
        source.fail_children_times(10);

        let result = Normalizer::new(store.clone())
            .with_retry_policy(1, Duration::from_millis(1))
            .run(&source, "ref", "snap", ts("2024-01-01T10:00:00Z"))
            .await;

        assert!(matches!(
            result,
            Err(NormalizeError::Source(SourceError::RateLimited))
        ));
        assert!(store.get_document_by_reference("ref").unwrap().is_none());
    }
}
