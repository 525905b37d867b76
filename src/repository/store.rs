//! SQLite-backed version store.
//!
//! Element history is append-only: metadata and content states are keyed
//! by `(element_id, version)` and never updated in place. The element row
//! carries cached pointers to its newest versions; every version insert
//! updates the pointer in the same transaction, and only when the new
//! version is strictly greater than the cached one. Readers therefore
//! never observe a version row newer than the pointers claim.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{connect, format_version, parse_datetime, parse_datetime_opt, with_retry, Result};
use crate::models::{
    Document, DocumentElement, ElementContent, ElementMetadata, Snapshot, SnapshotStatus,
    StructureNode,
};

/// SQLite-backed store for documents, elements and snapshots.
#[derive(Clone)]
pub struct VersionStore {
    db_path: PathBuf,
}

impl VersionStore {
    /// Open a store, creating the schema if needed.
    pub fn new(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Get the database path.
    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                reference_id TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                document_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS document_elements (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                element_type TEXT NOT NULL,
                latest_metadata_version TEXT,
                latest_content_version TEXT,
                latest_content_hash TEXT,
                FOREIGN KEY (document_id) REFERENCES documents(id)
            );

            CREATE TABLE IF NOT EXISTS document_element_metadata (
                element_id TEXT NOT NULL,
                version TEXT NOT NULL,
                level INTEGER NOT NULL,
                position INTEGER NOT NULL,
                parent_element TEXT,
                predecessor TEXT,
                successor TEXT,
                PRIMARY KEY (element_id, version),
                FOREIGN KEY (element_id) REFERENCES document_elements(id)
            );

            CREATE TABLE IF NOT EXISTS document_element_contents (
                element_id TEXT NOT NULL,
                version TEXT NOT NULL,
                content_raw TEXT NOT NULL,
                content_formatted TEXT,
                hash_raw TEXT NOT NULL,
                PRIMARY KEY (element_id, version),
                FOREIGN KEY (element_id) REFERENCES document_elements(id)
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                document_id TEXT,
                reference_id TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                executed_at TEXT,
                finished_at TEXT,
                status TEXT NOT NULL,
                structure TEXT,
                structure_diff TEXT,
                changed_elements TEXT,
                changed_elements_diff TEXT,
                error TEXT,
                FOREIGN KEY (document_id) REFERENCES documents(id)
            );

            CREATE INDEX IF NOT EXISTS idx_elements_document
                ON document_elements(document_id);
            CREATE INDEX IF NOT EXISTS idx_snapshots_reference
                ON snapshots(reference_id, triggered_at);
            CREATE INDEX IF NOT EXISTS idx_snapshots_document
                ON snapshots(document_id, triggered_at);
        "#,
        )?;
        Ok(())
    }

    // ----- documents -----

    /// Insert or update a document.
    pub fn upsert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.connect()?;
        upsert_document(&conn, doc)
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, reference_id, url, title, document_type, created_at, updated_at, is_active
             FROM documents WHERE id = ?",
            params![id],
            row_to_document,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_document_by_reference(&self, reference_id: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        get_document_by_reference(&conn, reference_id)
    }

    /// All tracked documents, newest first.
    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, reference_id, url, title, document_type, created_at, updated_at, is_active
             FROM documents ORDER BY created_at DESC",
        )?;
        let docs = stmt
            .query_map([], row_to_document)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    // ----- elements -----

    pub fn get_element(&self, id: &str) -> Result<Option<DocumentElement>> {
        let conn = self.connect()?;
        get_element(&conn, id)
    }

    /// All elements of a document joined to their current placement.
    ///
    /// Elements that have a metadata version but whose pointer is still
    /// unset never occur outside a broken database, so the join is inner.
    pub fn elements_with_placement(
        &self,
        document_id: &str,
    ) -> Result<Vec<(DocumentElement, ElementMetadata)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.document_id, e.element_type,
                    e.latest_metadata_version, e.latest_content_version, e.latest_content_hash,
                    m.element_id, m.version, m.level, m.position,
                    m.parent_element, m.predecessor, m.successor
             FROM document_elements e
             JOIN document_element_metadata m
               ON m.element_id = e.id AND m.version = e.latest_metadata_version
             WHERE e.document_id = ?
             ORDER BY m.level ASC, m.position ASC",
        )?;
        let rows = stmt
            .query_map(params![document_id], |row| {
                Ok((row_to_element(row)?, row_to_metadata_at(row, 6)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recent content versions for an element, newest first.
    pub fn latest_contents(&self, element_id: &str, limit: u32) -> Result<Vec<ElementContent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT element_id, version, content_raw, content_formatted, hash_raw
             FROM document_element_contents
             WHERE element_id = ?
             ORDER BY version DESC
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![element_id, limit], row_to_content)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ----- snapshots -----

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let conn = self.connect()?;
        let structure = snapshot
            .structure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed = snapshot
            .changed_elements
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let structure_diff = snapshot
            .structure_diff
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let content_diff = snapshot
            .changed_elements_diff
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO snapshots (id, document_id, reference_id, triggered_at, executed_at,
                                    finished_at, status, structure, structure_diff,
                                    changed_elements, changed_elements_diff, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                snapshot.id,
                snapshot.document_id,
                snapshot.reference_id,
                format_version(&snapshot.triggered_at),
                snapshot.executed_at.as_ref().map(format_version),
                snapshot.finished_at.as_ref().map(format_version),
                snapshot.status.as_str(),
                structure,
                structure_diff,
                changed,
                content_diff,
                snapshot.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("{SNAPSHOT_SELECT} WHERE id = ?"),
            params![id],
            row_to_snapshot,
        )
        .optional()
        .map_err(Into::into)
    }

    /// The snapshot immediately preceding `before` for a document, among
    /// those that recorded a structure.
    pub fn previous_snapshot(
        &self,
        document_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!(
                "{SNAPSHOT_SELECT}
                 WHERE document_id = ? AND triggered_at < ? AND structure IS NOT NULL
                 ORDER BY triggered_at DESC
                 LIMIT 1"
            ),
            params![document_id, format_version(&before)],
            row_to_snapshot,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Move an open snapshot to `pending`, stamping `executed_at`.
    ///
    /// Returns false if the snapshot was not in `open`, which means
    /// another worker already dispatched it.
    pub fn mark_pending(&self, id: &str, executed_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE snapshots SET status = 'pending', executed_at = ?
             WHERE id = ? AND status = 'open'",
            params![format_version(&executed_at), id],
        )?;
        Ok(changed > 0)
    }

    /// Move a pending snapshot to `processing_diffs`.
    pub fn mark_processing_diffs(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE snapshots SET status = 'processing_diffs'
             WHERE id = ? AND status = 'pending'",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Finish a pending snapshot that needs no diffs.
    pub fn finish_without_diffs(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE snapshots SET status = 'done', finished_at = ?
             WHERE id = ? AND status = 'pending'",
            params![format_version(&Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    /// Record a processing failure on a snapshot.
    pub fn record_error(&self, id: &str, message: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE snapshots SET status = 'error', error = ?, finished_at = ?
             WHERE id = ?",
            params![message, format_version(&Utc::now()), id],
        )?;
        Ok(())
    }

    /// Write the structure diff result onto a snapshot.
    pub fn set_structure_diff(&self, id: &str, diff: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(diff)?;
        with_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                "UPDATE snapshots SET structure_diff = ? WHERE id = ?",
                params![text, id],
            )?;
            Ok(())
        })
    }

    /// Write the per-element content diff result onto a snapshot.
    pub fn set_content_diff(&self, id: &str, diff: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(diff)?;
        with_retry(|| {
            let conn = self.connect()?;
            conn.execute(
                "UPDATE snapshots SET changed_elements_diff = ? WHERE id = ?",
                params![text, id],
            )?;
            Ok(())
        })
    }

    /// Flip `processing_diffs` to `done` once both diff results are in.
    ///
    /// A single conditional statement, so the two diff jobs can race on it
    /// freely; whichever finishes second performs the flip. Returns true
    /// if this call completed the snapshot.
    pub fn try_finish(&self, id: &str) -> Result<bool> {
        with_retry(|| {
            let conn = self.connect()?;
            let changed = conn.execute(
                "UPDATE snapshots SET status = 'done', finished_at = ?
                 WHERE id = ?
                   AND status = 'processing_diffs'
                   AND structure_diff IS NOT NULL
                   AND changed_elements_diff IS NOT NULL",
                params![format_version(&Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
    }

    // ----- maintenance -----

    /// Compare cached element pointers against the version rows.
    ///
    /// Returns one entry per disagreement; an empty result means the
    /// pointer invariant holds for the whole store.
    pub fn verify_pointer_consistency(&self) -> Result<Vec<PointerIssue>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT e.id,
                    e.latest_metadata_version,
                    (SELECT MAX(version) FROM document_element_metadata m
                      WHERE m.element_id = e.id),
                    e.latest_content_version,
                    (SELECT MAX(version) FROM document_element_contents c
                      WHERE c.element_id = e.id),
                    e.latest_content_hash,
                    (SELECT hash_raw FROM document_element_contents c
                      WHERE c.element_id = e.id ORDER BY version DESC LIMIT 1)
             FROM document_elements e",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut issues = Vec::new();
        for (id, meta_ptr, meta_max, content_ptr, content_max, hash_ptr, hash_max) in rows {
            if meta_ptr != meta_max {
                issues.push(PointerIssue {
                    element_id: id.clone(),
                    field: "latest_metadata_version",
                    cached: meta_ptr,
                    actual: meta_max,
                });
            }
            if content_ptr != content_max {
                issues.push(PointerIssue {
                    element_id: id.clone(),
                    field: "latest_content_version",
                    cached: content_ptr,
                    actual: content_max,
                });
            }
            if hash_ptr != hash_max {
                issues.push(PointerIssue {
                    element_id: id,
                    field: "latest_content_hash",
                    cached: hash_ptr,
                    actual: hash_max,
                });
            }
        }
        Ok(issues)
    }

    // ----- ingestion -----

    /// Begin an ingestion transaction.
    ///
    /// All writes of one normalization pass go through the returned handle
    /// and become visible atomically on commit. Dropping the handle
    /// without committing rolls everything back.
    pub fn begin_ingest(&self) -> Result<IngestTx> {
        let conn = self.connect()?;
        IngestTx::begin(conn)
    }
}

/// A cached pointer that disagrees with the version rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerIssue {
    pub element_id: String,
    pub field: &'static str,
    pub cached: Option<String>,
    pub actual: Option<String>,
}

impl std::fmt::Display for PointerIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "element {}: {} is {:?}, version rows say {:?}",
            self.element_id, self.field, self.cached, self.actual
        )
    }
}

/// Transaction handle covering one normalization pass.
pub struct IngestTx {
    conn: Connection,
    committed: bool,
}

impl IngestTx {
    fn begin(conn: Connection) -> Result<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    pub fn get_document_by_reference(&self, reference_id: &str) -> Result<Option<Document>> {
        get_document_by_reference(&self.conn, reference_id)
    }

    pub fn upsert_document(&self, doc: &Document) -> Result<()> {
        upsert_document(&self.conn, doc)
    }

    pub fn get_element(&self, id: &str) -> Result<Option<DocumentElement>> {
        get_element(&self.conn, id)
    }

    /// The element's current placement, via the cached metadata pointer.
    pub fn current_metadata(&self, element_id: &str) -> Result<Option<ElementMetadata>> {
        self.conn
            .query_row(
                "SELECT m.element_id, m.version, m.level, m.position,
                        m.parent_element, m.predecessor, m.successor
                 FROM document_element_metadata m
                 JOIN document_elements e
                   ON e.id = m.element_id AND e.latest_metadata_version = m.version
                 WHERE m.element_id = ?",
                params![element_id],
                |row| row_to_metadata_at(row, 0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a new element row with no versions yet.
    pub fn insert_element(&self, element: &DocumentElement) -> Result<()> {
        self.conn.execute(
            "INSERT INTO document_elements (id, document_id, element_type)
             VALUES (?, ?, ?)",
            params![element.id, element.document_id, element.element_type],
        )?;
        Ok(())
    }

    /// Append a metadata version and advance the cached pointer.
    ///
    /// The pointer only moves forward: an out-of-order insert leaves it
    /// untouched.
    pub fn insert_metadata_version(&self, meta: &ElementMetadata) -> Result<()> {
        let version = format_version(&meta.version);
        self.conn.execute(
            "INSERT INTO document_element_metadata
                 (element_id, version, level, position, parent_element, predecessor, successor)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                meta.element_id,
                version,
                meta.level,
                meta.position,
                meta.parent_element,
                meta.predecessor,
                meta.successor,
            ],
        )?;
        self.conn.execute(
            "UPDATE document_elements SET latest_metadata_version = ?2
             WHERE id = ?1
               AND (latest_metadata_version IS NULL OR latest_metadata_version < ?2)",
            params![meta.element_id, version],
        )?;
        Ok(())
    }

    /// Append a content version and advance the cached pointer and hash.
    pub fn insert_content_version(&self, content: &ElementContent) -> Result<()> {
        let version = format_version(&content.version);
        self.conn.execute(
            "INSERT INTO document_element_contents
                 (element_id, version, content_raw, content_formatted, hash_raw)
             VALUES (?, ?, ?, ?, ?)",
            params![
                content.element_id,
                version,
                content.content_raw,
                content.content_formatted,
                content.hash_raw,
            ],
        )?;
        self.conn.execute(
            "UPDATE document_elements
                SET latest_content_version = ?2, latest_content_hash = ?3
             WHERE id = ?1
               AND (latest_content_version IS NULL OR latest_content_version < ?2)",
            params![content.element_id, version, content.hash_raw],
        )?;
        Ok(())
    }

    /// Record the normalization result on the snapshot row.
    pub fn record_snapshot_result(
        &self,
        snapshot_id: &str,
        document_id: &str,
        structure: &[StructureNode],
        changed_elements: &[String],
    ) -> Result<()> {
        let structure = serde_json::to_string(structure)?;
        let changed = serde_json::to_string(changed_elements)?;
        self.conn.execute(
            "UPDATE snapshots
                SET document_id = ?2, structure = ?3, changed_elements = ?4
             WHERE id = ?1",
            params![snapshot_id, document_id, structure, changed],
        )?;
        Ok(())
    }

    /// Commit the pass, making all writes visible at once.
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for IngestTx {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

// ----- shared statement helpers -----

const SNAPSHOT_SELECT: &str = "SELECT id, document_id, reference_id, triggered_at, executed_at, \
     finished_at, status, structure, structure_diff, changed_elements, \
     changed_elements_diff, error FROM snapshots";

fn upsert_document(conn: &Connection, doc: &Document) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (id, reference_id, url, title, document_type,
                                created_at, updated_at, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             url = excluded.url,
             title = excluded.title,
             document_type = excluded.document_type,
             updated_at = excluded.updated_at,
             is_active = excluded.is_active",
        params![
            doc.id,
            doc.reference_id,
            doc.url,
            doc.title,
            doc.document_type,
            format_version(&doc.created_at),
            format_version(&doc.updated_at),
            doc.is_active,
        ],
    )?;
    Ok(())
}

fn get_document_by_reference(conn: &Connection, reference_id: &str) -> Result<Option<Document>> {
    conn.query_row(
        "SELECT id, reference_id, url, title, document_type, created_at, updated_at, is_active
         FROM documents WHERE reference_id = ?",
        params![reference_id],
        row_to_document,
    )
    .optional()
    .map_err(Into::into)
}

fn get_element(conn: &Connection, id: &str) -> Result<Option<DocumentElement>> {
    conn.query_row(
        "SELECT id, document_id, element_type, latest_metadata_version,
                latest_content_version, latest_content_hash
         FROM document_elements WHERE id = ?",
        params![id],
        row_to_element,
    )
    .optional()
    .map_err(Into::into)
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        reference_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        document_type: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
        is_active: row.get(7)?,
    })
}

fn row_to_element(row: &Row) -> rusqlite::Result<DocumentElement> {
    Ok(DocumentElement {
        id: row.get(0)?,
        document_id: row.get(1)?,
        element_type: row.get(2)?,
        latest_metadata_version: parse_datetime_opt(row.get(3)?),
        latest_content_version: parse_datetime_opt(row.get(4)?),
        latest_content_hash: row.get(5)?,
    })
}

fn row_to_metadata_at(row: &Row, base: usize) -> rusqlite::Result<ElementMetadata> {
    Ok(ElementMetadata {
        element_id: row.get(base)?,
        version: parse_datetime(&row.get::<_, String>(base + 1)?),
        level: row.get(base + 2)?,
        position: row.get(base + 3)?,
        parent_element: row.get(base + 4)?,
        predecessor: row.get(base + 5)?,
        successor: row.get(base + 6)?,
    })
}

fn row_to_content(row: &Row) -> rusqlite::Result<ElementContent> {
    Ok(ElementContent {
        element_id: row.get(0)?,
        version: parse_datetime(&row.get::<_, String>(1)?),
        content_raw: row.get(2)?,
        content_formatted: row.get(3)?,
        hash_raw: row.get(4)?,
    })
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    let status_text: String = row.get(6)?;
    let status = SnapshotStatus::from_str(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown snapshot status: {status_text}").into(),
        )
    })?;
    Ok(Snapshot {
        id: row.get(0)?,
        document_id: row.get(1)?,
        reference_id: row.get(2)?,
        triggered_at: parse_datetime(&row.get::<_, String>(3)?),
        executed_at: parse_datetime_opt(row.get(4)?),
        finished_at: parse_datetime_opt(row.get(5)?),
        status,
        structure: parse_json_column(row, 7)?,
        structure_diff: parse_json_column(row, 8)?,
        changed_elements: parse_json_column(row, 9)?,
        changed_elements_diff: parse_json_column(row, 10)?,
        error: row.get(11)?,
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> VersionStore {
        VersionStore::new(&dir.path().join("strata.db")).unwrap()
    }

    fn sample_document() -> Document {
        Document::new(
            "ref-1".to_string(),
            "https://example.test/ref-1".to_string(),
            "Handbook".to_string(),
            "page".to_string(),
        )
    }

    #[test]
    fn test_document_upsert_and_lookup() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut doc = sample_document();
        store.upsert_document(&doc).unwrap();

        let loaded = store.get_document_by_reference("ref-1").unwrap().unwrap();
        assert_eq!(loaded.id, doc.id);
        assert_eq!(loaded.title, "Handbook");

        doc.title = "Handbook v2".to_string();
        store.upsert_document(&doc).unwrap();
        let loaded = store.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Handbook v2");
        assert_eq!(store.list_documents().unwrap().len(), 1);
    }

    #[test]
    fn test_ingest_writes_versions_and_pointers() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = sample_document();
        store.upsert_document(&doc).unwrap();

        let version = Utc::now();
        let tx = store.begin_ingest().unwrap();
        tx.insert_element(&DocumentElement::new(
            "b1".to_string(),
            doc.id.clone(),
            "paragraph".to_string(),
        ))
        .unwrap();
        tx.insert_metadata_version(&ElementMetadata {
            element_id: "b1".to_string(),
            version,
            level: 0,
            position: 0,
            parent_element: None,
            predecessor: None,
            successor: None,
        })
        .unwrap();
        tx.insert_content_version(&ElementContent::new(
            "b1".to_string(),
            version,
            "hello".to_string(),
            None,
        ))
        .unwrap();
        tx.commit().unwrap();

        let element = store.get_element("b1").unwrap().unwrap();
        assert_eq!(
            element.latest_content_hash.as_deref(),
            Some(ElementContent::compute_hash("hello").as_str())
        );
        assert_eq!(
            element.latest_content_version.unwrap().timestamp_micros(),
            version.timestamp_micros()
        );

        let placements = store.elements_with_placement(&doc.id).unwrap();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].1.position, 0);

        assert!(store.verify_pointer_consistency().unwrap().is_empty());
    }

    #[test]
    fn test_pointer_updates_are_monotonic() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = sample_document();
        store.upsert_document(&doc).unwrap();

        let newer = Utc::now();
        let older = newer - Duration::seconds(60);

        let tx = store.begin_ingest().unwrap();
        tx.insert_element(&DocumentElement::new(
            "b1".to_string(),
            doc.id.clone(),
            "paragraph".to_string(),
        ))
        .unwrap();
        tx.insert_content_version(&ElementContent::new(
            "b1".to_string(),
            newer,
            "new text".to_string(),
            None,
        ))
        .unwrap();
        // A late write of an older observation must not move the pointer back
        tx.insert_content_version(&ElementContent::new(
            "b1".to_string(),
            older,
            "old text".to_string(),
            None,
        ))
        .unwrap();
        tx.commit().unwrap();

        let element = store.get_element("b1").unwrap().unwrap();
        assert_eq!(
            element.latest_content_version.unwrap().timestamp_micros(),
            newer.timestamp_micros()
        );
        assert_eq!(
            element.latest_content_hash.unwrap(),
            ElementContent::compute_hash("new text")
        );
        assert!(store.verify_pointer_consistency().unwrap().is_empty());

        assert_eq!(store.latest_contents("b1", 2).unwrap().len(), 2);
        assert_eq!(store.latest_contents("b1", 2).unwrap()[0].content_raw, "new text");
    }

    #[test]
    fn test_ingest_rolls_back_on_drop() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = sample_document();
        store.upsert_document(&doc).unwrap();

        {
            let tx = store.begin_ingest().unwrap();
            tx.insert_element(&DocumentElement::new(
                "b1".to_string(),
                doc.id.clone(),
                "paragraph".to_string(),
            ))
            .unwrap();
            // dropped without commit
        }

        assert!(store.get_element("b1").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_state_transitions() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let snapshot = Snapshot::new("ref-1".to_string());
        store.insert_snapshot(&snapshot).unwrap();

        assert!(store.mark_pending(&snapshot.id, Utc::now()).unwrap());
        // second dispatch loses the race
        assert!(!store.mark_pending(&snapshot.id, Utc::now()).unwrap());

        assert!(store.mark_processing_diffs(&snapshot.id).unwrap());

        // neither diff present yet
        assert!(!store.try_finish(&snapshot.id).unwrap());

        store
            .set_structure_diff(&snapshot.id, &serde_json::json!({"inserted": []}))
            .unwrap();
        assert!(!store.try_finish(&snapshot.id).unwrap());

        store
            .set_content_diff(&snapshot.id, &serde_json::json!({"b1": "diff"}))
            .unwrap();
        assert!(store.try_finish(&snapshot.id).unwrap());
        // idempotent: already done
        assert!(!store.try_finish(&snapshot.id).unwrap());

        let loaded = store.get_snapshot(&snapshot.id).unwrap().unwrap();
        assert_eq!(loaded.status, SnapshotStatus::Done);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn test_finish_without_diffs_requires_pending() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let snapshot = Snapshot::new("ref-1".to_string());
        store.insert_snapshot(&snapshot).unwrap();
        assert!(!store.finish_without_diffs(&snapshot.id).unwrap());

        store.mark_pending(&snapshot.id, Utc::now()).unwrap();
        assert!(store.finish_without_diffs(&snapshot.id).unwrap());
    }

    #[test]
    fn test_record_error() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let snapshot = Snapshot::new("ref-1".to_string());
        store.insert_snapshot(&snapshot).unwrap();
        store.record_error(&snapshot.id, "source unreachable").unwrap();

        let loaded = store.get_snapshot(&snapshot.id).unwrap().unwrap();
        assert_eq!(loaded.status, SnapshotStatus::Error);
        assert_eq!(loaded.error.as_deref(), Some("source unreachable"));
    }

    #[test]
    fn test_previous_snapshot_ordering() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = sample_document();
        store.upsert_document(&doc).unwrap();

        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut snap = Snapshot::new("ref-1".to_string());
            snap.document_id = Some(doc.id.clone());
            snap.triggered_at = base + Duration::seconds(i);
            snap.structure = Some(vec![StructureNode::new(format!("b{i}"))]);
            store.insert_snapshot(&snap).unwrap();
            ids.push(snap.id);
        }
        // one snapshot without structure must never be picked
        let mut bare = Snapshot::new("ref-1".to_string());
        bare.document_id = Some(doc.id.clone());
        bare.triggered_at = base + Duration::seconds(1) + Duration::milliseconds(500);
        store.insert_snapshot(&bare).unwrap();

        let previous = store
            .previous_snapshot(&doc.id, base + Duration::seconds(2))
            .unwrap()
            .unwrap();
        assert_eq!(previous.id, ids[1]);

        let none = store.previous_snapshot(&doc.id, base).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_verify_detects_corrupted_pointer() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let doc = sample_document();
        store.upsert_document(&doc).unwrap();

        let version = Utc::now();
        let tx = store.begin_ingest().unwrap();
        tx.insert_element(&DocumentElement::new(
            "b1".to_string(),
            doc.id.clone(),
            "paragraph".to_string(),
        ))
        .unwrap();
        tx.insert_content_version(&ElementContent::new(
            "b1".to_string(),
            version,
            "hello".to_string(),
            None,
        ))
        .unwrap();
        tx.commit().unwrap();

        // corrupt the cached hash behind the store's back
        let conn = connect(store.database_path()).unwrap();
        conn.execute(
            "UPDATE document_elements SET latest_content_hash = 'bogus' WHERE id = 'b1'",
            [],
        )
        .unwrap();

        let issues = store.verify_pointer_consistency().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "latest_content_hash");
        assert_eq!(issues[0].cached.as_deref(), Some("bogus"));
    }
}
