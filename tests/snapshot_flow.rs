//! End-to-end snapshot flow against a real SQLite file.
//!
//! Drives the public service API the way the server and CLI do: snapshots
//! created through the queue, processed by the worker pool, results read
//! back from the store.

use std::sync::Arc;

use strata::models::SnapshotStatus;
use strata::orchestrator::SnapshotService;
use strata::queue::{JobQueue, WorkerPool};
use strata::repository::VersionStore;
use strata::source::MemoryBlockSource;

fn fixture(dir: &tempfile::TempDir) -> (Arc<SnapshotService>, JobQueue, Arc<MemoryBlockSource>) {
    let db = dir.path().join("strata.db");
    let store = VersionStore::new(&db).unwrap();
    let queue = JobQueue::new(&db).unwrap();

    let source = Arc::new(MemoryBlockSource::new(
        "https://example.test/handbook",
        "Handbook",
    ));
    source.set_children(
        "handbook",
        vec![
            MemoryBlockSource::parent_block("intro", "Welcome"),
            MemoryBlockSource::text_block("faq", "Questions and answers"),
        ],
    );
    source.set_children(
        "intro",
        vec![
            MemoryBlockSource::text_block("intro-1", "First paragraph"),
            MemoryBlockSource::text_block("intro-2", "Second paragraph"),
        ],
    );

    let service = Arc::new(SnapshotService::new(store, queue.clone(), source.clone()));
    (service, queue, source)
}

async fn drain(queue: &JobQueue, service: &Arc<SnapshotService>) {
    let stats = WorkerPool::new(queue.clone(), Arc::clone(service), 2)
        .run(true)
        .await;
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_first_ingestion_builds_the_full_version_history() {
    let dir = tempfile::tempdir().unwrap();
    let (service, queue, _source) = fixture(&dir);

    let snapshot_id = service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    let snapshot = service.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert!(snapshot.finished_at.is_some());
    assert!(snapshot.structure_diff.is_none());

    let store = service.store();
    let document = store
        .get_document_by_reference("handbook")
        .unwrap()
        .unwrap();
    assert_eq!(document.title, "Handbook");

    let elements = store.elements_with_placement(&document.id).unwrap();
    assert_eq!(elements.len(), 4);

    // positions index the flattened pre-order traversal
    let mut placements: Vec<(String, i64, i64)> = elements
        .iter()
        .map(|(e, m)| (e.id.clone(), m.level, m.position))
        .collect();
    placements.sort_by_key(|(_, _, position)| *position);
    assert_eq!(
        placements,
        vec![
            ("intro".to_string(), 0, 0),
            ("intro-1".to_string(), 1, 1),
            ("intro-2".to_string(), 1, 2),
            ("faq".to_string(), 0, 3),
        ]
    );

    for (element, _) in &elements {
        assert!(element.latest_metadata_version.is_some());
        assert!(element.latest_content_version.is_some());
        assert_eq!(store.latest_contents(&element.id, 10).unwrap().len(), 1);
    }
    assert!(store.verify_pointer_consistency().unwrap().is_empty());
}

#[tokio::test]
async fn test_content_change_is_versioned_and_diffed() {
    let dir = tempfile::tempdir().unwrap();
    let (service, queue, source) = fixture(&dir);

    service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    source.set_children(
        "intro",
        vec![
            MemoryBlockSource::text_block("intro-1", "First paragraph, revised"),
            MemoryBlockSource::text_block("intro-2", "Second paragraph"),
        ],
    );
    let snapshot_id = service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    let snapshot = service.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert_eq!(snapshot.changed_elements, Some(vec!["intro-1".to_string()]));

    let content_diff = snapshot.changed_elements_diff.unwrap();
    let diff_text = content_diff["intro-1"].as_str().unwrap();
    assert!(diff_text.contains("-First paragraph"));
    assert!(diff_text.contains("+First paragraph, revised"));

    let structure_diff = snapshot.structure_diff.unwrap();
    assert_eq!(structure_diff["old_elements_count"], 4);
    assert_eq!(structure_diff["new_elements_count"], 4);
    assert_eq!(structure_diff["inserted"], serde_json::json!([]));
    assert_eq!(structure_diff["deleted"], serde_json::json!([]));

    // two content versions for the edited element, one for the rest
    let store = service.store();
    assert_eq!(store.latest_contents("intro-1", 10).unwrap().len(), 2);
    assert_eq!(store.latest_contents("intro-2", 10).unwrap().len(), 1);
    assert!(store.verify_pointer_consistency().unwrap().is_empty());
}

#[tokio::test]
async fn test_unchanged_reingestion_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (service, queue, _source) = fixture(&dir);

    service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;
    let snapshot_id = service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    let snapshot = service.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert_eq!(snapshot.changed_elements, Some(Vec::new()));
    assert!(snapshot.structure_diff.is_none());
    assert!(snapshot.changed_elements_diff.is_none());

    // no element grew a second version
    let store = service.store();
    for element_id in ["intro", "intro-1", "intro-2", "faq"] {
        assert_eq!(store.latest_contents(element_id, 10).unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_block_move_reports_structure_diff_only() {
    let dir = tempfile::tempdir().unwrap();
    let (service, queue, source) = fixture(&dir);

    service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    // move intro-2 out of the intro section to the top level
    source.set_children(
        "intro",
        vec![MemoryBlockSource::text_block("intro-1", "First paragraph")],
    );
    source.set_children(
        "handbook",
        vec![
            MemoryBlockSource::parent_block("intro", "Welcome"),
            MemoryBlockSource::text_block("intro-2", "Second paragraph"),
            MemoryBlockSource::text_block("faq", "Questions and answers"),
        ],
    );
    let snapshot_id = service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    let snapshot = service.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert_eq!(snapshot.changed_elements, Some(Vec::new()));

    let structure_diff = snapshot.structure_diff.unwrap();
    assert_eq!(structure_diff["inserted"], serde_json::json!([]));
    assert_eq!(structure_diff["deleted"], serde_json::json!([]));
    let moved = structure_diff["moved"].as_array().unwrap();
    let hierarchy_move = moved
        .iter()
        .find(|m| m["id"] == "intro-2")
        .expect("intro-2 should register as moved");
    assert_eq!(hierarchy_move["kind"], "hierarchy");
    assert_eq!(hierarchy_move["old_parent"], "intro");
    assert!(hierarchy_move["new_parent"].is_null());

    assert_eq!(
        snapshot.changed_elements_diff.unwrap(),
        serde_json::json!({})
    );
    assert!(service
        .store()
        .verify_pointer_consistency()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_inserted_and_deleted_blocks_are_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let (service, queue, source) = fixture(&dir);

    service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    // drop the faq block and add a changelog block in its place
    source.set_children(
        "handbook",
        vec![
            MemoryBlockSource::parent_block("intro", "Welcome"),
            MemoryBlockSource::text_block("changelog", "What changed"),
        ],
    );
    let snapshot_id = service.create_snapshot("handbook", None).await.unwrap();
    drain(&queue, &service).await;

    let snapshot = service.get_snapshot(&snapshot_id).unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Done);

    let structure_diff = snapshot.structure_diff.unwrap();
    assert_eq!(structure_diff["inserted"], serde_json::json!(["changelog"]));
    assert_eq!(structure_diff["deleted"], serde_json::json!(["faq"]));

    // the new element is brand-new, so the content diff skips it
    assert_eq!(
        snapshot.changed_elements_diff.unwrap(),
        serde_json::json!({})
    );

    // deleted elements keep their history
    let store = service.store();
    assert_eq!(store.latest_contents("faq", 10).unwrap().len(), 1);
}
