//! Repository layer for SQLite persistence.
//!
//! The version store owns all durable state: documents, elements, their
//! append-only version rows, and snapshots. Connections are opened per
//! operation; WAL mode plus a busy timeout covers concurrent workers.

mod store;

pub use store::{IngestTx, PointerIssue, VersionStore};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Errors surfaced by the repository layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored value could not be decoded: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Open a database connection with proper concurrency settings.
pub(crate) fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

/// Retry an operation a few times when SQLite reports the database busy.
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 3;

    let mut attempt = 0;
    loop {
        match op() {
            Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)))
                if attempt < MAX_ATTEMPTS
                    && matches!(
                        err.code,
                        rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                    ) =>
            {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
            }
            other => return other,
        }
    }
}

/// Format a version timestamp for storage.
///
/// Fixed microsecond precision keeps lexicographic order on the TEXT
/// column identical to chronological order, which the monotonic pointer
/// updates rely on.
pub(crate) fn format_version(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version_orders_lexicographically() {
        let half = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let tenth = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.10Z")
            .unwrap()
            .with_timezone(&Utc);
        // 0.5s is after 0.10s; fixed precision keeps string order agreeing
        assert!(half > tenth);
        assert!(format_version(&half) > format_version(&tenth));
    }

    #[test]
    fn test_parse_datetime_round_trip() {
        let now = Utc::now();
        let parsed = parse_datetime(&format_version(&now));
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_parse_datetime_invalid_defaults_to_epoch() {
        assert_eq!(parse_datetime("not a date"), DateTime::UNIX_EPOCH);
        assert_eq!(parse_datetime_opt(Some("nope".to_string())), None);
        assert_eq!(parse_datetime_opt(None), None);
    }
}
