//! Reference event store over the `auth_events` table.

use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{EventSource, SourceError};
use crate::baseline::BaselineSample;
use crate::context::{ContextKey, ContextKeyResolver};
use crate::model::event::local_hour_start;
use crate::model::{AuthEvent, BehavioralAggregate, EntityRef, EntityType, TimeWindow};
use crate::storage::{ts_from_sql, ts_to_sql, Pool};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
enum EventFilter {
    All,
    Device(String),
    State(String),
    District(String, String),
    Provider(String),
    Context(String, String),
}

impl EventFilter {
    fn for_entity(entity: &EntityRef) -> Self {
        match entity.entity_type() {
            EntityType::Device => EventFilter::Device(entity.entity_id().to_string()),
            EntityType::Region => match entity.entity_id().split_once('-') {
                Some((s, d)) => EventFilter::District(s.to_string(), d.to_string()),
                None => EventFilter::State(entity.entity_id().to_string()),
            },
            EntityType::ServiceProvider => EventFilter::Provider(entity.entity_id().to_string()),
        }
    }
}

const EVENT_COLUMNS: &str = "timestamp, auth_type, service_category, service_provider_id, device_hash, \
     state_code, district_code, retry_count, is_fallback, status, session_duration_ms";

#[derive(Clone)]
pub struct SqliteEventSource {
    pool: Pool,
}

impl SqliteEventSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Validate and insert events in one transaction. Events failing the
    /// anonymization checks are skipped and counted.
    pub fn ingest(&self, events: &[AuthEvent]) -> Result<IngestReport> {
        let mut conn = self.pool.get().context("failed to get DB connection")?;
        let tx = conn.transaction()?;
        let mut report = IngestReport::default();
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO auth_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                EVENT_COLUMNS
            ))?;
            for ev in events {
                if let Err(e) = ev.validate() {
                    warn!(error = %e, "rejecting event");
                    report.rejected += 1;
                    continue;
                }
                stmt.execute(params![
                    ts_to_sql(ev.timestamp),
                    ev.auth_type.as_str(),
                    ev.service_category.as_str(),
                    ev.service_provider_id,
                    ev.device_hash.to_ascii_lowercase(),
                    ev.state_code,
                    ev.district_code,
                    ev.retry_count,
                    ev.is_fallback,
                    ev.status.as_str(),
                    ev.session_duration_ms.map(|v| v as i64),
                ])?;
                report.inserted += 1;
            }
        }
        tx.commit()?;
        info!(inserted = report.inserted, rejected = report.rejected, "events ingested");
        Ok(report)
    }

    /// Ingest a JSON-lines file; unparseable lines count as rejected.
    pub fn ingest_jsonl(&self, path: &Path) -> Result<IngestReport> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open event file: {}", path.display()))?;
        let mut events = Vec::new();
        let mut unparsed = 0;
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuthEvent>(&line) {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping malformed event line");
                    unparsed += 1;
                }
            }
        }
        let mut report = self.ingest(&events)?;
        report.rejected += unparsed;
        Ok(report)
    }

    /// Total events stored.
    pub fn count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM auth_events", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn load_events(pool: &Pool, window: TimeWindow, filter: &EventFilter) -> Result<Vec<AuthEvent>> {
        let conn = pool.get().context("failed to get DB connection")?;
        let start = ts_to_sql(window.start);
        let end = ts_to_sql(window.end);
        let base = format!(
            "SELECT {} FROM auth_events WHERE timestamp >= ?1 AND timestamp < ?2",
            EVENT_COLUMNS
        );
        let (sql, extra): (String, Vec<String>) = match filter {
            EventFilter::All => (base, vec![]),
            EventFilter::Device(d) => (format!("{} AND device_hash = ?3", base), vec![d.to_ascii_lowercase()]),
            EventFilter::State(s) => (format!("{} AND state_code = ?3", base), vec![s.clone()]),
            EventFilter::District(s, d) => (
                format!("{} AND state_code = ?3 AND district_code = ?4", base),
                vec![s.clone(), d.clone()],
            ),
            EventFilter::Provider(p) => (format!("{} AND service_provider_id = ?3", base), vec![p.clone()]),
            EventFilter::Context(s, c) => (
                format!("{} AND state_code = ?3 AND service_category = ?4", base),
                vec![s.clone(), c.clone()],
            ),
        };
        let sql = format!("{} ORDER BY timestamp", sql);

        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&start, &end];
        for v in &extra {
            bind.push(v);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bind.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, bool>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<i64>>(10)?,
            ))
        })?;

        let mut events = Vec::new();
        for r in rows {
            let (ts, auth, cat, provider, device, state, district, retries, fallback, status, session) = r?;
            events.push(AuthEvent {
                timestamp: ts_from_sql(&ts)?,
                auth_type: auth.parse()?,
                service_category: cat.parse()?,
                service_provider_id: provider,
                device_hash: device,
                state_code: state,
                district_code: district,
                retry_count: retries,
                is_fallback: fallback,
                status: status.parse()?,
                session_duration_ms: session.map(|v| v.max(0) as u64),
            });
        }
        Ok(events)
    }

    async fn query(&self, window: TimeWindow, filter: EventFilter) -> Result<Vec<AuthEvent>, SourceError> {
        let pool = self.pool.clone();
        let events = tokio::task::spawn_blocking(move || Self::load_events(&pool, window, &filter))
            .await
            .map_err(|e| SourceError::Unavailable(format!("query task failed: {}", e)))??;
        debug!(events = events.len(), "events loaded");
        Ok(events)
    }
}

/// Group events by (device, local hour) into hour-long aggregates.
fn entity_hours(events: Vec<AuthEvent>) -> Vec<BehavioralAggregate> {
    let mut groups: HashMap<(String, DateTime<Utc>), Vec<AuthEvent>> = HashMap::new();
    for ev in events {
        let hour = local_hour_start(ev.timestamp);
        groups
            .entry((ev.device_hash.to_ascii_lowercase(), hour))
            .or_default()
            .push(ev);
    }
    let mut out: Vec<BehavioralAggregate> = groups
        .into_iter()
        .filter_map(|((device, hour), evs)| {
            let entity = EntityRef::device(device).ok()?;
            let window = TimeWindow::new(hour, hour + Duration::hours(1)).ok()?;
            Some(BehavioralAggregate::from_events(entity, window, &evs))
        })
        .collect();
    out.sort_by(|a, b| {
        b.window
            .start
            .cmp(&a.window.start)
            .then_with(|| a.entity.cmp(&b.entity))
    });
    out
}

#[async_trait]
impl EventSource for SqliteEventSource {
    async fn aggregate(&self, entity: &EntityRef, window: TimeWindow) -> Result<BehavioralAggregate, SourceError> {
        let events = self.query(window, EventFilter::for_entity(entity)).await?;
        Ok(BehavioralAggregate::from_events(entity.clone(), window, &events))
    }

    async fn recent_samples(&self, key: &ContextKey, window: TimeWindow) -> Result<Vec<BaselineSample>, SourceError> {
        let events = self
            .query(
                window,
                EventFilter::Context(key.region().to_string(), key.category().as_str().to_string()),
            )
            .await?;
        let in_bucket: Vec<AuthEvent> = events
            .into_iter()
            .filter(|ev| ContextKeyResolver::for_event(ev).is_ok_and(|k| &k == key))
            .collect();
        let mut samples: Vec<BaselineSample> = entity_hours(in_bucket)
            .iter()
            .filter_map(BaselineSample::from_aggregate)
            .collect();
        samples.sort_by_key(|s| s.observed_at);
        Ok(samples)
    }

    async fn active_contexts(&self, window: TimeWindow) -> Result<Vec<ContextKey>, SourceError> {
        let events = self.query(window, EventFilter::All).await?;
        let keys: BTreeSet<ContextKey> = events
            .iter()
            .filter_map(|ev| ContextKeyResolver::for_event(ev).ok())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn entity_hour_aggregates(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<BehavioralAggregate>, SourceError> {
        let events = self.query(window, EventFilter::All).await?;
        let mut out = entity_hours(events);
        out.truncate(limit);
        Ok(out)
    }

    async fn active_entities(
        &self,
        entity_type: EntityType,
        window: TimeWindow,
        min_events: u64,
    ) -> Result<Vec<EntityRef>, SourceError> {
        let column = match entity_type {
            EntityType::Device => "device_hash",
            EntityType::Region => "state_code",
            EntityType::ServiceProvider => "service_provider_id",
        };
        let pool = self.pool.clone();
        let ids = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = pool.get().context("failed to get DB connection")?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {col}, COUNT(*) AS n FROM auth_events
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 GROUP BY {col} HAVING n >= ?3 ORDER BY n DESC",
                col = column
            ))?;
            let rows = stmt.query_map(
                params![ts_to_sql(window.start), ts_to_sql(window.end), min_events as i64],
                |row| row.get::<_, String>(0),
            )?;
            let mut ids = Vec::new();
            for r in rows {
                ids.push(r?);
            }
            Ok(ids)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("query task failed: {}", e)))??;

        Ok(ids
            .into_iter()
            .filter_map(|id| EntityRef::new(entity_type, id).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::aggregate::test_support::{event, ist, DEVICE};
    use crate::storage::open_memory_pool;

    fn source() -> SqliteEventSource {
        SqliteEventSource::new(open_memory_pool().unwrap())
    }

    #[tokio::test]
    async fn test_ingest_rejects_raw_identifiers() {
        let src = source();
        let good = event(ist(2024, 3, 4, 10, 0));
        let mut bad = event(ist(2024, 3, 4, 10, 5));
        bad.device_hash = "123456789012".into();
        let report = src.ingest(&[good, bad]).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(src.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_jsonl_rejects_unknown_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let ok = serde_json::to_string(&event(ist(2024, 3, 4, 10, 0))).unwrap();
        let mut smuggled: serde_json::Value = serde_json::from_str(&ok).unwrap();
        smuggled["biometric_template"] = serde_json::json!("AAAA");
        std::fs::write(&path, format!("{}\n\n{}\nnot json\n", ok, smuggled)).unwrap();

        let report = source().ingest_jsonl(&path).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 2);
    }

    #[tokio::test]
    async fn test_aggregate_and_active_entities() {
        let src = source();
        let mut events: Vec<AuthEvent> = (0..6).map(|i| event(ist(2024, 3, 4, 10, i * 5))).collect();
        let mut other = event(ist(2024, 3, 4, 10, 40));
        other.device_hash = "ffffffffffffffff0000000000000001".into();
        other.state_code = "KA".into();
        events.push(other);
        src.ingest(&events).unwrap();

        let window = TimeWindow::new(ist(2024, 3, 4, 9, 0), ist(2024, 3, 4, 12, 0)).unwrap();
        let agg = src
            .aggregate(&EntityRef::device(DEVICE).unwrap(), window)
            .await
            .unwrap();
        assert_eq!(agg.event_count, 6);

        let region = src.aggregate(&EntityRef::region("KA").unwrap(), window).await.unwrap();
        assert_eq!(region.event_count, 1);

        let devices = src.active_entities(EntityType::Device, window, 2).await.unwrap();
        assert_eq!(devices, vec![EntityRef::device(DEVICE).unwrap()]);
    }

    #[tokio::test]
    async fn test_samples_are_entity_hours_within_context() {
        let src = source();
        let mut events = Vec::new();
        for h in [9, 10, 11] {
            for m in [0, 20, 40] {
                events.push(event(ist(2024, 3, 4, h, m)));
            }
        }
        // Evening event: different hour band.
        events.push(event(ist(2024, 3, 4, 19, 0)));
        src.ingest(&events).unwrap();

        let window = TimeWindow::new(ist(2024, 3, 4, 0, 0), ist(2024, 3, 5, 0, 0)).unwrap();
        let contexts = src.active_contexts(window).await.unwrap();
        assert_eq!(contexts.len(), 2);

        let morning: ContextKey = "MH|BANKING|MORNING|WEEKDAY".parse().unwrap();
        let samples = src.recent_samples(&morning, window).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| (s.auth_rate - 3.0).abs() < 1e-9));
        assert!(samples.windows(2).all(|w| w[0].observed_at < w[1].observed_at));

        let hours = src.entity_hour_aggregates(window, 2).await.unwrap();
        assert_eq!(hours.len(), 2);
        assert!(hours[0].window.start > hours[1].window.start);
    }
}
