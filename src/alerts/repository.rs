//! SQLite persistence for alerts. Rows are never deleted; every update is a
//! compare-and-swap on `version`.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::warn;

use super::{Alert, AlertFilter, AlertPage, AlertStatistics, DailyCount, Page};
use crate::analysis::features::FeatureVector;
use crate::context::ContextKey;
use crate::detect::CompositeRiskScore;
use crate::model::event::to_local;
use crate::model::EntityType;
use crate::storage::{ts_from_sql, ts_to_sql, Pool};

const COLUMNS: &str = "id, entity_type, entity_id, alert_type, title, description, severity, action_tier, \
     rule_score, anomaly_score, composite_score, confidence, rule_only, region, context_key, status, \
     reason_codes_json, suggested_actions_json, feedback, analyst_confidence, feedback_notes, feedback_by, \
     acknowledged_by, created_at, updated_at, acknowledged_at, resolved_at, feedback_at, active_until, \
     evaluation_count, features_json, version";

/// Per-context alert totals used to seed the equity guardrail.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextFeedback {
    pub context_key: ContextKey,
    pub alerts: u64,
    pub false_positives: u64,
}

/// Runs on the connection right before a CAS write (tests only).
#[cfg(test)]
pub(crate) type CasHook = std::sync::Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Clone)]
pub struct AlertRepository {
    pool: Pool,
    #[cfg(test)]
    before_cas: Option<CasHook>,
}

impl AlertRepository {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            #[cfg(test)]
            before_cas: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cas_hook(mut self, hook: CasHook) -> Self {
        self.before_cas = Some(hook);
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    pub async fn insert(&self, alert: Alert) -> Result<()> {
        self.with_conn(move |conn| insert(conn, &alert)).await
    }

    /// Write `alert` if the stored row is still at `expected_version`.
    /// Returns false on a version mismatch.
    pub async fn update_cas(&self, alert: Alert, expected_version: u64) -> Result<bool> {
        #[cfg(test)]
        let hook = self.before_cas.clone();
        self.with_conn(move |conn| {
            #[cfg(test)]
            if let Some(h) = &hook {
                h(conn);
            }
            update_cas(conn, &alert, expected_version)
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Alert>> {
        let id = id.to_string();
        self.with_conn(move |conn| get(conn, &id)).await
    }

    /// Newest non-resolved alert for a dedup key.
    pub async fn find_open(&self, entity_type: EntityType, entity_id: &str, alert_type: super::AlertType) -> Result<Option<Alert>> {
        let entity_id = entity_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM alerts
                 WHERE entity_type = ?1 AND entity_id = ?2 AND alert_type = ?3 AND status != 'RESOLVED'
                 ORDER BY created_at DESC LIMIT 1",
                COLUMNS
            );
            let alert = conn
                .query_row(
                    &sql,
                    params![entity_type.as_str(), entity_id, alert_type.as_str()],
                    row_to_alert,
                )
                .optional()?;
            Ok(alert)
        })
        .await
    }

    pub async fn list(&self, filter: AlertFilter, page: Page) -> Result<AlertPage> {
        self.with_conn(move |conn| list(conn, &filter, page)).await
    }

    pub async fn statistics(&self, now: DateTime<Utc>) -> Result<AlertStatistics> {
        self.with_conn(move |conn| statistics(conn, now)).await
    }

    /// Feature vectors of alerts analysts marked FALSE_POSITIVE.
    pub async fn false_positive_features(&self) -> Result<Vec<FeatureVector>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT features_json FROM alerts
                 WHERE feedback = 'FALSE_POSITIVE' AND features_json IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for json in rows {
                out.push(serde_json::from_str(&json?).context("bad features_json")?);
            }
            Ok(out)
        })
        .await
    }

    /// Entities carrying at least one alert not labeled FALSE_POSITIVE.
    pub async fn flagged_entities(&self) -> Result<HashSet<(EntityType, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT entity_type, entity_id FROM alerts
                 WHERE feedback IS NULL OR feedback != 'FALSE_POSITIVE'",
            )?;
            let rows = stmt.query_map([], |row| Ok((parsed::<EntityType>(row, 0)?, row.get::<_, String>(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
        })
        .await
    }

    pub async fn context_feedback(&self) -> Result<Vec<ContextFeedback>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT context_key, COUNT(*),
                        SUM(CASE WHEN feedback = 'FALSE_POSITIVE' THEN 1 ELSE 0 END)
                 FROM alerts WHERE context_key IS NOT NULL GROUP BY context_key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (key, alerts, fps) = row?;
                match ContextKey::from_str(&key) {
                    Ok(context_key) => out.push(ContextFeedback {
                        context_key,
                        alerts: alerts as u64,
                        false_positives: fps as u64,
                    }),
                    Err(e) => warn!(key = %key, error = %e, "skipping alert with unparseable context key"),
                }
            }
            Ok(out)
        })
        .await
    }
}

// ----------------------------------------------------------------------------
// Synchronous helpers
// ----------------------------------------------------------------------------

fn insert(conn: &Connection, a: &Alert) -> Result<()> {
    let features = a.features.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO alerts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)",
            COLUMNS
        ),
        params![
            a.id,
            a.entity_type.as_str(),
            a.entity_id,
            a.alert_type.as_str(),
            a.title,
            a.description,
            a.score.severity.as_str(),
            a.score.action_tier.as_str(),
            a.score.rule_score,
            a.score.anomaly_score,
            a.score.composite,
            a.score.confidence,
            a.score.rule_only,
            a.region,
            a.context_key.as_ref().map(|k| k.to_string()),
            a.status.as_str(),
            serde_json::to_string(&a.reason_codes)?,
            serde_json::to_string(&a.suggested_actions)?,
            a.feedback.map(|f| f.as_str()),
            a.analyst_confidence,
            a.feedback_notes,
            a.feedback_by,
            a.acknowledged_by,
            ts_to_sql(a.created_at),
            ts_to_sql(a.updated_at),
            a.acknowledged_at.map(ts_to_sql),
            a.resolved_at.map(ts_to_sql),
            a.feedback_at.map(ts_to_sql),
            ts_to_sql(a.active_until),
            a.evaluation_count,
            features,
            a.version as i64,
        ],
    )
    .with_context(|| format!("failed to insert alert {}", a.id))?;
    Ok(())
}

fn update_cas(conn: &Connection, a: &Alert, expected_version: u64) -> Result<bool> {
    let features = a.features.as_ref().map(serde_json::to_string).transpose()?;
    let changed = conn.execute(
        "UPDATE alerts SET
            title = ?1, description = ?2, severity = ?3, action_tier = ?4, rule_score = ?5,
            anomaly_score = ?6, composite_score = ?7, confidence = ?8, rule_only = ?9,
            status = ?10, reason_codes_json = ?11, suggested_actions_json = ?12, feedback = ?13,
            analyst_confidence = ?14, feedback_notes = ?15, feedback_by = ?16, acknowledged_by = ?17,
            updated_at = ?18, acknowledged_at = ?19, resolved_at = ?20, feedback_at = ?21,
            active_until = ?22, evaluation_count = ?23, features_json = ?24, version = ?25
         WHERE id = ?26 AND version = ?27",
        params![
            a.title,
            a.description,
            a.score.severity.as_str(),
            a.score.action_tier.as_str(),
            a.score.rule_score,
            a.score.anomaly_score,
            a.score.composite,
            a.score.confidence,
            a.score.rule_only,
            a.status.as_str(),
            serde_json::to_string(&a.reason_codes)?,
            serde_json::to_string(&a.suggested_actions)?,
            a.feedback.map(|f| f.as_str()),
            a.analyst_confidence,
            a.feedback_notes,
            a.feedback_by,
            a.acknowledged_by,
            ts_to_sql(a.updated_at),
            a.acknowledged_at.map(ts_to_sql),
            a.resolved_at.map(ts_to_sql),
            a.feedback_at.map(ts_to_sql),
            ts_to_sql(a.active_until),
            a.evaluation_count,
            features,
            a.version as i64,
            a.id,
            expected_version as i64,
        ],
    )?;
    Ok(changed == 1)
}

fn get(conn: &Connection, id: &str) -> Result<Option<Alert>> {
    let sql = format!("SELECT {} FROM alerts WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_alert).optional()?)
}

fn list(conn: &Connection, filter: &AlertFilter, page: Page) -> Result<AlertPage> {
    let mut clauses = Vec::new();
    let mut values: Vec<String> = Vec::new();
    if let Some(s) = filter.status {
        values.push(s.as_str().to_string());
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(s) = filter.severity {
        values.push(s.as_str().to_string());
        clauses.push(format!("severity = ?{}", values.len()));
    }
    if let Some(t) = filter.alert_type {
        values.push(t.as_str().to_string());
        clauses.push(format!("alert_type = ?{}", values.len()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM alerts {}", where_sql),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {} FROM alerts {} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
        COLUMNS, where_sql, page.limit, page.offset
    );
    let mut stmt = conn.prepare(&sql)?;
    let alerts = stmt
        .query_map(params_from_iter(values.iter()), row_to_alert)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(AlertPage {
        alerts,
        total: total as u64,
        limit: page.limit,
        offset: page.offset,
    })
}

fn grouped(conn: &Connection, column: &str, extra: &str) -> Result<BTreeMap<String, u64>> {
    let sql = format!(
        "SELECT {col}, COUNT(*) FROM alerts WHERE {col} IS NOT NULL {extra} GROUP BY {col}",
        col = column,
        extra = extra
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?;
    Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
}

fn statistics(conn: &Connection, now: DateTime<Utc>) -> Result<AlertStatistics> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
    let open = |severity: &str| -> Result<u64> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE status != 'RESOLVED' AND severity = ?1",
            params![severity],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    };

    // Seven local days ending today.
    let today = to_local(now).date_naive();
    let first = today - Duration::days(6);
    let mut per_day: BTreeMap<NaiveDate, u64> = (0..7).map(|i| (first + Duration::days(i), 0)).collect();
    let mut stmt = conn.prepare("SELECT created_at FROM alerts WHERE created_at >= ?1")?;
    let since = ts_to_sql(now - Duration::days(8));
    for created in stmt.query_map(params![since], |row| row.get::<_, String>(0))? {
        let day = to_local(ts_from_sql(&created?)?).date_naive();
        if let Some(n) = per_day.get_mut(&day) {
            *n += 1;
        }
    }

    Ok(AlertStatistics {
        total: total as u64,
        by_severity: grouped(conn, "severity", "")?,
        by_status: grouped(conn, "status", "")?,
        by_type: grouped(conn, "alert_type", "")?,
        open_critical: open("CRITICAL")?,
        open_high: open("HIGH")?,
        feedback: grouped(conn, "feedback", "")?,
        trend: per_day.into_iter().map(|(date, count)| DailyCount { date, count }).collect(),
    })
}

// ----------------------------------------------------------------------------
// Row decoding
// ----------------------------------------------------------------------------

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion(idx, e))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    ts_from_sql(&s).map_err(|e| conversion(idx, e))
}

fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| ts_from_sql(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion(idx, e))
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        entity_type: parsed(row, 1)?,
        entity_id: row.get(2)?,
        alert_type: parsed(row, 3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        score: CompositeRiskScore {
            severity: parsed(row, 6)?,
            action_tier: parsed(row, 7)?,
            rule_score: row.get(8)?,
            anomaly_score: row.get(9)?,
            composite: row.get(10)?,
            confidence: row.get(11)?,
            rule_only: row.get(12)?,
        },
        region: row.get(13)?,
        context_key: row
            .get::<_, Option<String>>(14)?
            .map(|s| s.parse().map_err(|e| conversion(14, e)))
            .transpose()?,
        status: parsed(row, 15)?,
        reason_codes: json(row, 16)?,
        suggested_actions: json(row, 17)?,
        feedback: row
            .get::<_, Option<String>>(18)?
            .map(|s| s.parse().map_err(|e| conversion(18, e)))
            .transpose()?,
        analyst_confidence: row.get(19)?,
        feedback_notes: row.get(20)?,
        feedback_by: row.get(21)?,
        acknowledged_by: row.get(22)?,
        created_at: timestamp(row, 23)?,
        updated_at: timestamp(row, 24)?,
        acknowledged_at: opt_timestamp(row, 25)?,
        resolved_at: opt_timestamp(row, 26)?,
        feedback_at: opt_timestamp(row, 27)?,
        active_until: timestamp(row, 28)?,
        evaluation_count: row.get(29)?,
        features: row
            .get::<_, Option<String>>(30)?
            .map(|s| serde_json::from_str(&s).map_err(|e| conversion(30, e)))
            .transpose()?,
        version: row.get::<_, i64>(31)? as u64,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::alerts::{AlertStatus, AlertType};
    use crate::detect::rules::RuleId;
    use crate::detect::{ActionTier, Severity};

    pub fn sample_alert(id: &str, now: DateTime<Utc>) -> Alert {
        Alert {
            id: id.to_string(),
            entity_type: EntityType::Device,
            entity_id: "a1b2c3d4e5f60718293a4b5c6d7e8f90".into(),
            alert_type: AlertType::VelocityAttack,
            title: "Velocity Attack Detected".into(),
            description: String::new(),
            score: CompositeRiskScore {
                rule_score: 55.0,
                anomaly_score: 70.0,
                composite: 61.0,
                severity: Severity::High,
                confidence: 0.85,
                action_tier: ActionTier::EscalateRegional,
                rule_only: false,
            },
            region: Some("MH".into()),
            context_key: Some("MH|BANKING|MORNING|WEEKDAY".parse().unwrap()),
            status: AlertStatus::Active,
            reason_codes: vec![RuleId::HighFrequency, RuleId::GeographicVelocity],
            suggested_actions: vec!["Track geographic patterns".into()],
            feedback: None,
            analyst_confidence: None,
            feedback_notes: None,
            feedback_by: None,
            acknowledged_by: None,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            resolved_at: None,
            feedback_at: None,
            active_until: now + Duration::hours(6),
            evaluation_count: 1,
            features: Some(FeatureVector::zeros()),
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_alert;
    use super::*;
    use crate::alerts::{AlertStatus, AlertType, Feedback};
    use crate::detect::Severity;
    use crate::storage::open_memory_pool;

    fn repo() -> AlertRepository {
        AlertRepository::new(open_memory_pool().unwrap())
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let repo = repo();
        let now = ts_from_sql("2024-03-04T05:00:00.000Z").unwrap();
        let alert = sample_alert("ALR-0000000A", now);
        repo.insert(alert.clone()).await.unwrap();
        assert_eq!(repo.get("ALR-0000000A").await.unwrap(), Some(alert));
        assert_eq!(repo.get("ALR-FFFFFFFF").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let repo = repo();
        let now = Utc::now();
        let mut alert = sample_alert("ALR-0000000B", now);
        repo.insert(alert.clone()).await.unwrap();

        alert.version = 2;
        alert.evaluation_count = 2;
        assert!(repo.update_cas(alert.clone(), 1).await.unwrap());
        // Second writer still believes version 1.
        assert!(!repo.update_cas(alert.clone(), 1).await.unwrap());
        assert_eq!(repo.get("ALR-0000000B").await.unwrap().unwrap().evaluation_count, 2);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let repo = repo();
        let now = Utc::now();
        for i in 0..5 {
            let mut a = sample_alert(&format!("ALR-0000001{}", i), now + Duration::minutes(i));
            if i % 2 == 0 {
                a.score.severity = Severity::Medium;
            }
            repo.insert(a).await.unwrap();
        }
        let page = repo.list(AlertFilter::default(), Page::new(2, 0)).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.alerts.len(), 2);
        assert_eq!(page.alerts[0].id, "ALR-00000014");

        let medium = AlertFilter {
            severity: Some(Severity::Medium),
            ..Default::default()
        };
        assert_eq!(repo.list(medium, Page::default()).await.unwrap().total, 3);

        let resolved = AlertFilter {
            status: Some(AlertStatus::Resolved),
            ..Default::default()
        };
        assert_eq!(repo.list(resolved, Page::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_statistics_and_training_inputs() {
        let repo = repo();
        let now = Utc::now();
        let mut fp = sample_alert("ALR-00000020", now);
        fp.feedback = Some(Feedback::FalsePositive);
        fp.entity_id = "ffffffffffffffffffffffffffffffff".into();
        repo.insert(fp).await.unwrap();
        let mut geo = sample_alert("ALR-00000021", now);
        geo.alert_type = AlertType::GeographicAnomaly;
        geo.score.severity = Severity::Critical;
        repo.insert(geo).await.unwrap();

        let stats = repo.statistics(now).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open_critical, 1);
        assert_eq!(stats.open_high, 1);
        assert_eq!(stats.feedback.get("FALSE_POSITIVE"), Some(&1));
        assert_eq!(stats.trend.len(), 7);
        assert_eq!(stats.trend.last().unwrap().count, 2);

        assert_eq!(repo.false_positive_features().await.unwrap().len(), 1);
        let flagged = repo.flagged_entities().await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged.contains(&(EntityType::Device, "a1b2c3d4e5f60718293a4b5c6d7e8f90".to_string())));

        let per_context = repo.context_feedback().await.unwrap();
        assert_eq!(per_context.len(), 1);
        assert_eq!(per_context[0].alerts, 2);
        assert_eq!(per_context[0].false_positives, 1);
    }
}
