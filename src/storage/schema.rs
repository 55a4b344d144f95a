//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS auth_events (
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            auth_type TEXT NOT NULL,
            service_category TEXT NOT NULL,
            service_provider_id TEXT NOT NULL,
            device_hash TEXT NOT NULL,
            state_code TEXT NOT NULL,
            district_code TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            is_fallback INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            session_duration_ms INTEGER,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_auth_events_ts ON auth_events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_auth_events_device ON auth_events(device_hash, timestamp);
        CREATE INDEX IF NOT EXISTS idx_auth_events_region ON auth_events(state_code, timestamp);
        CREATE INDEX IF NOT EXISTS idx_auth_events_provider ON auth_events(service_provider_id, timestamp);

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL,
            action_tier TEXT NOT NULL,
            rule_score REAL NOT NULL,
            anomaly_score REAL NOT NULL,
            composite_score REAL NOT NULL,
            confidence REAL NOT NULL,
            rule_only INTEGER NOT NULL DEFAULT 0,
            region TEXT,
            context_key TEXT,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            reason_codes_json TEXT NOT NULL,
            suggested_actions_json TEXT NOT NULL,
            feedback TEXT,
            analyst_confidence REAL,
            feedback_notes TEXT,
            feedback_by TEXT,
            acknowledged_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT,
            feedback_at TEXT,
            active_until TEXT NOT NULL,
            evaluation_count INTEGER NOT NULL DEFAULT 1,
            features_json TEXT,
            version INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON alerts(entity_type, entity_id, alert_type, status);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_context ON alerts(context_key);

        CREATE TABLE IF NOT EXISTS model_versions (
            version INTEGER PRIMARY KEY,
            trained_at TEXT NOT NULL,
            training_vectors INTEGER NOT NULL,
            labeled_normals INTEGER NOT NULL DEFAULT 0,
            calibration_median REAL NOT NULL,
            model_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["auth_events", "alerts", "model_versions"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }
}
