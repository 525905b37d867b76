//! Durable job queue backed by the same SQLite database as the store.
//!
//! Jobs carry only a snapshot id and a kind; all real state lives on the
//! snapshot row, which keeps every kind idempotent. Claiming is a single
//! conditional UPDATE, so concurrent workers never hand out the same job
//! twice. A running job whose worker died becomes claimable again once
//! its visibility timeout passes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use crate::orchestrator::SnapshotService;
use crate::repository::{
    connect, format_version, parse_datetime, parse_datetime_opt, with_retry, Result, StoreError,
};

/// What a queued job asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Ingest,
    StructureDiff,
    ContentDiff,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::StructureDiff => "structure_diff",
            Self::ContentDiff => "content_diff",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "structure_diff" => Some(Self::StructureDiff),
            "content_diff" => Some(Self::ContentDiff),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the jobs table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub snapshot_id: String,
    pub kind: JobKind,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: i64,
}

/// Queue handle; connections are opened per operation like the store.
#[derive(Clone)]
pub struct JobQueue {
    db_path: PathBuf,
}

const JOB_COLUMNS: &str =
    "id, snapshot_id, kind, status, created_at, started_at, finished_at, attempts";

impl JobQueue {
    /// Open the queue, creating the jobs table if needed.
    pub fn new(db_path: &Path) -> Result<Self> {
        let queue = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = connect(&queue.db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at);
        "#,
        )?;
        Ok(queue)
    }

    /// Insert a pending job and return its id.
    pub fn enqueue(&self, snapshot_id: &str, kind: JobKind) -> Result<i64> {
        with_retry(|| {
            let conn = connect(&self.db_path)?;
            conn.execute(
                "INSERT INTO jobs (snapshot_id, kind, status, created_at)
                 VALUES (?, ?, 'pending', ?)",
                params![snapshot_id, kind.as_str(), format_version(&Utc::now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Claim the oldest runnable job, if any.
    ///
    /// Runnable means pending, or running with a `started_at` older than
    /// the visibility timeout (its worker is presumed gone). The claim is
    /// one conditional UPDATE, so two workers cannot claim the same job.
    pub fn claim(&self, visibility_timeout: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let stale = now - chrono::Duration::milliseconds(visibility_timeout.as_millis() as i64);
        with_retry(|| {
            let conn = connect(&self.db_path)?;
            conn.query_row(
                &format!(
                    "UPDATE jobs
                        SET status = 'running', started_at = ?1, attempts = attempts + 1
                      WHERE id = (SELECT id FROM jobs
                                  WHERE status = 'pending'
                                     OR (status = 'running' AND started_at < ?2)
                                  ORDER BY created_at ASC, id ASC
                                  LIMIT 1)
                      RETURNING {JOB_COLUMNS}"
                ),
                params![format_version(&now), format_version(&stale)],
                row_to_job,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Mark a job done.
    pub fn complete(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, "done")
    }

    /// Mark a job failed. Failed jobs are not retried; the error lives on
    /// the snapshot.
    pub fn fail(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, "failed")
    }

    fn finish(&self, job_id: i64, status: &str) -> Result<()> {
        with_retry(|| {
            let conn = connect(&self.db_path)?;
            conn.execute(
                "UPDATE jobs SET status = ?, finished_at = ? WHERE id = ?",
                params![status, format_version(&Utc::now()), job_id],
            )?;
            Ok(())
        })
    }

    /// Job counts grouped by status.
    pub fn counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = connect(&self.db_path)?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let kind: String = row.get(2)?;
    let kind = JobKind::from_str(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job kind {kind}").into(),
        )
    })?;
    let created_at: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        snapshot_id: row.get(1)?,
        kind,
        status: row.get(3)?,
        created_at: parse_datetime(&created_at),
        started_at: parse_datetime_opt(row.get(5)?),
        finished_at: parse_datetime_opt(row.get(6)?),
        attempts: row.get(7)?,
    })
}

/// Outcome counters from a pool run.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub processed: usize,
    pub failed: usize,
}

/// Pool of workers draining the job queue.
pub struct WorkerPool {
    queue: JobQueue,
    service: Arc<SnapshotService>,
    workers: usize,
    visibility_timeout: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, service: Arc<SnapshotService>, workers: usize) -> Self {
        Self {
            queue,
            service,
            workers,
            visibility_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Run the pool.
    ///
    /// With `drain` set, workers exit once the queue stays empty and the
    /// stats are returned; otherwise they keep polling indefinitely.
    pub async fn run(&self, drain: bool) -> PoolStats {
        let processed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let queue = self.queue.clone();
            let service = self.service.clone();
            let visibility_timeout = self.visibility_timeout;
            let processed = processed.clone();
            let failed = failed.clone();

            let handle = tokio::spawn(async move {
                loop {
                    let job = match queue.claim(visibility_timeout) {
                        Ok(Some(job)) => job,
                        Ok(None) => {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            match queue.claim(visibility_timeout) {
                                Ok(Some(job)) => job,
                                _ if drain => break,
                                _ => continue,
                            }
                        }
                        Err(e) => {
                            warn!(worker_id, error = %e, "claim failed");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            continue;
                        }
                    };

                    debug!(
                        worker_id,
                        job_id = job.id,
                        kind = %job.kind,
                        snapshot_id = %job.snapshot_id,
                        "claimed job"
                    );

                    match service.execute_job(&job).await {
                        Ok(()) => {
                            if let Err(e) = queue.complete(job.id) {
                                error!(job_id = job.id, error = %e, "failed to mark job done");
                            }
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(
                                worker_id,
                                job_id = job.id,
                                kind = %job.kind,
                                error = %e,
                                "job failed"
                            );
                            if let Err(e) = queue.fail(job.id) {
                                error!(job_id = job.id, error = %e, "failed to mark job failed");
                            }
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        let stats = PoolStats {
            processed: processed.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };
        info!(
            processed = stats.processed,
            failed = stats.failed,
            "worker pool drained"
        );
        stats
    }
}
