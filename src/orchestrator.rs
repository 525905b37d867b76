//! Snapshot lifecycle orchestration.
//!
//! `SnapshotService` owns the state machine: `open -> pending ->
//! {done | processing_diffs | error}` and `processing_diffs -> {done |
//! error}`. Creating a snapshot only writes a row and queues the ingest
//! job; dispatch runs the normalizer and decides whether diff jobs are
//! needed. Dispatches for the same reference are serialized through a
//! per-reference lock so concurrent passes cannot interleave versions of
//! one document.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::diff;
use crate::models::{Snapshot, SnapshotStatus};
use crate::normalize::{NormalizeError, NormalizeOutcome, Normalizer};
use crate::queue::{Job, JobKind, JobQueue};
use crate::repository::{StoreError, VersionStore};
use crate::source::BlockSource;

/// Errors from the snapshot service.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Diff(#[from] diff::DiffError),
}

/// Coordinates snapshot creation, normalization and diff fan-out.
pub struct SnapshotService {
    store: VersionStore,
    queue: JobQueue,
    source: Arc<dyn BlockSource>,
    normalizer: Normalizer,
    /// Per-request source tokens, consumed at dispatch. Never persisted.
    tokens: Mutex<HashMap<String, String>>,
    reference_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotService {
    pub fn new(store: VersionStore, queue: JobQueue, source: Arc<dyn BlockSource>) -> Self {
        let normalizer = Normalizer::new(store.clone());
        Self {
            store,
            queue,
            source,
            normalizer,
            tokens: Mutex::new(HashMap::new()),
            reference_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Create a snapshot row and enqueue its ingest job.
    ///
    /// A caller-provided token is kept in memory until the dispatch that
    /// consumes it; it never reaches the database.
    pub async fn create_snapshot(
        &self,
        reference_id: &str,
        token: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let snapshot = Snapshot::new(reference_id.to_string());
        self.store.insert_snapshot(&snapshot)?;
        if let Some(token) = token {
            self.tokens
                .lock()
                .await
                .insert(snapshot.id.clone(), token.to_string());
        }
        self.queue.enqueue(&snapshot.id, JobKind::Ingest)?;
        info!(snapshot_id = %snapshot.id, reference_id, "snapshot queued");
        Ok(snapshot.id)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, OrchestratorError> {
        Ok(self.store.get_snapshot(id)?)
    }

    /// Run the ingest flow for a snapshot and fan out diff jobs when the
    /// pass changed an existing document.
    pub async fn dispatch(&self, snapshot_id: &str) -> Result<(), OrchestratorError> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| OrchestratorError::SnapshotNotFound(snapshot_id.to_string()))?;

        let lock = self.reference_lock(&snapshot.reference_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        if !self.store.mark_pending(snapshot_id, now)? {
            let current = self
                .store
                .get_snapshot(snapshot_id)?
                .ok_or_else(|| OrchestratorError::SnapshotNotFound(snapshot_id.to_string()))?;
            if current.status != SnapshotStatus::Pending {
                debug!(
                    snapshot_id,
                    status = current.status.as_str(),
                    "snapshot already dispatched"
                );
                return Ok(());
            }
            // a worker died mid-pass; the transaction rolled back, so
            // running again from pending is safe
            warn!(snapshot_id, "re-running stale pending snapshot");
        }

        let token = self.tokens.lock().await.remove(snapshot_id);
        let source = token
            .and_then(|t| self.source.with_token(&t))
            .unwrap_or_else(|| self.source.clone());

        let outcome = match self
            .normalizer
            .run(source.as_ref(), &snapshot.reference_id, snapshot_id, now)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(snapshot_id, &format!("normalization failed: {e}"));
                return Err(e.into());
            }
        };

        if !outcome.is_update
            || (outcome.changed_elements.is_empty()
                && !self.structure_changed(&outcome, snapshot.triggered_at)?)
        {
            self.store.finish_without_diffs(snapshot_id)?;
            info!(snapshot_id, "snapshot done, nothing to diff");
        } else {
            self.store.mark_processing_diffs(snapshot_id)?;
            self.queue.enqueue(snapshot_id, JobKind::StructureDiff)?;
            self.queue.enqueue(snapshot_id, JobKind::ContentDiff)?;
            info!(
                snapshot_id,
                changed = outcome.changed_elements.len(),
                "diff jobs queued"
            );
        }
        Ok(())
    }

    /// Create and fully process a snapshot in the current task, diff jobs
    /// included. The server goes through the queue instead.
    pub async fn run_inline(&self, reference_id: &str) -> Result<Snapshot, OrchestratorError> {
        let snapshot = Snapshot::new(reference_id.to_string());
        self.store.insert_snapshot(&snapshot)?;
        self.dispatch(&snapshot.id).await?;

        let current = self
            .store
            .get_snapshot(&snapshot.id)?
            .ok_or_else(|| OrchestratorError::SnapshotNotFound(snapshot.id.clone()))?;
        if current.status == SnapshotStatus::ProcessingDiffs {
            self.run_diff(JobKind::StructureDiff, &snapshot.id)?;
            self.run_diff(JobKind::ContentDiff, &snapshot.id)?;
        }
        self.store
            .get_snapshot(&snapshot.id)?
            .ok_or_else(|| OrchestratorError::SnapshotNotFound(snapshot.id.clone()))
    }

    /// Execute one claimed queue job.
    pub async fn execute_job(&self, job: &Job) -> Result<(), OrchestratorError> {
        match job.kind {
            JobKind::Ingest => self.dispatch(&job.snapshot_id).await,
            JobKind::StructureDiff | JobKind::ContentDiff => {
                self.run_diff(job.kind, &job.snapshot_id)
            }
        }
    }

    fn run_diff(&self, kind: JobKind, snapshot_id: &str) -> Result<(), OrchestratorError> {
        let result = match kind {
            JobKind::ContentDiff => diff::content::run(&self.store, snapshot_id),
            _ => diff::structure::run(&self.store, snapshot_id),
        };
        result.map_err(|e| {
            self.record_failure(snapshot_id, &format!("{kind} failed: {e}"));
            e.into()
        })
    }

    /// True if the observed structure differs from the structure recorded
    /// on the previous snapshot of the same document. A structure-only
    /// change, a move without edits, still needs the diff jobs.
    fn structure_changed(
        &self,
        outcome: &NormalizeOutcome,
        triggered_at: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let previous = self
            .store
            .previous_snapshot(&outcome.document_id, triggered_at)?;
        Ok(match previous.and_then(|p| p.structure) {
            Some(previous) => previous != outcome.structure,
            None => true,
        })
    }

    async fn reference_lock(&self, reference_id: &str) -> Arc<Mutex<()>> {
        self.reference_locks
            .lock()
            .await
            .entry(reference_id.to_string())
            .or_default()
            .clone()
    }

    fn record_failure(&self, snapshot_id: &str, message: &str) {
        // error recording must not mask the original failure
        if let Err(e) = self.store.record_error(snapshot_id, message) {
            error!(snapshot_id, error = %e, "failed to record snapshot error");
        }
    }
}
