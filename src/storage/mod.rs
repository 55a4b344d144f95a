//! SQLite storage layer -- pool, schema, timestamp encoding.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory: {}", parent.display()))?;
        }
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).with_context(|| format!("failed to open database: {}", path))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory database, used by tests and dry runs.
/// One connection only: every new in-memory connection is a separate database.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Timestamps are stored as fixed-width RFC 3339 UTC with milliseconds so
/// lexicographic order matches chronological order.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_encoding_sorts() {
        let a = DateTime::parse_from_rfc3339("2024-03-04T09:05:00Z").unwrap().with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2024-03-04T10:00:00.5Z").unwrap().with_timezone(&Utc);
        assert!(ts_to_sql(a) < ts_to_sql(b));
        assert_eq!(ts_to_sql(a), "2024-03-04T09:05:00.000Z");
        assert_eq!(ts_from_sql(&ts_to_sql(b)).unwrap(), b);
    }

    #[test]
    fn test_open_pool_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db/amews.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
