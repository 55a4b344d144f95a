//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::alerts::{AlertFilter, AlertStatus, AlertType, FeedbackInput, Page};
use crate::baseline::Baseline;
use crate::context::ContextKey;
use crate::detect::Severity;
use crate::model::{EntityType, TimeWindow};

type ApiResult = Result<Json<Value>, ApiError>;

const API_ACTOR: &str = "api";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/risk/analyze", post(analyze))
        .route("/alerts", get(list_alerts))
        .route("/alerts/statistics", get(alert_statistics))
        .route("/alerts/{id}", get(get_alert).patch(update_alert))
        .route("/alerts/{id}/feedback", post(alert_feedback))
        .route("/baseline/status", get(baseline_status))
        .route("/baseline/contexts", get(baseline_contexts))
        .route("/baseline/reset", post(baseline_reset))
        .route("/equity/flags", get(equity_flags))
        .route("/equity/recalibrate", post(equity_recalibrate))
        .route("/model", get(model_info))
        .route("/model/retrain", post(model_retrain))
}

fn envelope<T: Serialize>(data: T) -> ApiResult {
    envelope_with(data, json!({}))
}

fn envelope_with<T: Serialize>(data: T, mut meta: Value) -> ApiResult {
    let data = serde_json::to_value(data).map_err(|e| ApiError::Internal(e.into()))?;
    if let Value::Object(m) = &mut meta {
        m.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        m.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    }
    Ok(Json(json!({ "data": data, "meta": meta })))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> ApiResult {
    let s = &state.services;
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": s.mode.current(),
        "model_version": s.registry.info().map(|m| m.version),
    }))
}

// ---------------------------------------------------------------------------
// Risk analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    entity_type: String,
    entity_id: String,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
}

async fn analyze(State(state): State<AppState>, Json(req): Json<AnalyzeRequest>) -> ApiResult {
    let s = &state.services;
    let entity_type: EntityType = req.entity_type.parse()?;
    let window = match (req.window_start, req.window_end) {
        (None, None) => None,
        (start, end) => {
            let end = end.unwrap_or_else(Utc::now);
            let start = start.unwrap_or(end - Duration::hours(s.config.alerts.default_window_hours));
            Some(TimeWindow::new(start, end)?)
        }
    };
    let outcome = s.engine.analyze(entity_type, &req.entity_id, window).await?;
    envelope(outcome)
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct AlertsQuery {
    status: Option<String>,
    severity: Option<String>,
    alert_type: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_alerts(State(state): State<AppState>, Query(q): Query<AlertsQuery>) -> ApiResult {
    let filter = AlertFilter {
        status: q.status.as_deref().map(str::parse::<AlertStatus>).transpose()?,
        severity: q.severity.as_deref().map(str::parse::<Severity>).transpose()?,
        alert_type: q.alert_type.as_deref().map(str::parse::<AlertType>).transpose()?,
    };
    let defaults = Page::default();
    let page = Page::new(q.limit.unwrap_or(defaults.limit), q.offset.unwrap_or(defaults.offset));
    let result = state.services.alerts.list(filter, page).await?;
    let meta = json!({ "total": result.total, "limit": result.limit, "offset": result.offset });
    envelope_with(result.alerts, meta)
}

async fn alert_statistics(State(state): State<AppState>) -> ApiResult {
    envelope(state.services.alerts.statistics(Utc::now()).await?)
}

async fn get_alert(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    envelope(state.services.alerts.get(&id).await?)
}

#[derive(Debug, Deserialize)]
struct UpdateAlertRequest {
    status: Option<String>,
    actor: Option<String>,
    feedback: Option<FeedbackInput>,
}

async fn update_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAlertRequest>,
) -> ApiResult {
    let alerts = &state.services.alerts;
    if req.status.is_none() && req.feedback.is_none() {
        return Err(ApiError::BadRequest("expected `status` or `feedback`".into()));
    }
    let now = Utc::now();
    // Feedback first: it is rejected once the alert is resolved.
    let mut alert = None;
    if let Some(feedback) = req.feedback {
        alert = Some(alerts.record_feedback(&id, feedback, now).await?);
    }
    if let Some(status) = req.status.as_deref() {
        let to: AlertStatus = status.parse()?;
        let actor = req.actor.as_deref().unwrap_or(API_ACTOR);
        alert = Some(alerts.transition(&id, to, actor, now).await?);
    }
    envelope(alert)
}

async fn alert_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<FeedbackInput>,
) -> ApiResult {
    envelope(state.services.alerts.record_feedback(&id, input, Utc::now()).await?)
}

// ---------------------------------------------------------------------------
// Baselines and mode
// ---------------------------------------------------------------------------

async fn baseline_status(State(state): State<AppState>) -> ApiResult {
    let s = &state.services;
    let now = Utc::now();
    let status = s.mode.status(now).await;
    let contexts = s.store.progress_all(now);
    envelope(json!({ "mode": status, "contexts": contexts }))
}

async fn baseline_contexts(State(state): State<AppState>) -> ApiResult {
    let snapshots = state.services.store.snapshots(Utc::now());
    let baselines: Vec<&Baseline> = snapshots.iter().map(|b| b.as_ref()).collect();
    let meta = json!({ "total": baselines.len() });
    envelope_with(baselines, meta)
}

#[derive(Debug, Deserialize)]
struct JustifiedRequest {
    actor: Option<String>,
    #[serde(default)]
    justification: String,
}

async fn baseline_reset(State(state): State<AppState>, Json(req): Json<JustifiedRequest>) -> ApiResult {
    let actor = req.actor.as_deref().unwrap_or(API_ACTOR);
    let status = state.services.mode.reset(actor, &req.justification, Utc::now()).await?;
    envelope(status)
}

// ---------------------------------------------------------------------------
// Equity guardrail
// ---------------------------------------------------------------------------

async fn equity_flags(State(state): State<AppState>) -> ApiResult {
    let flags = state.services.equity.flags();
    let meta = json!({ "total": flags.len() });
    envelope_with(flags, meta)
}

#[derive(Debug, Deserialize)]
struct RecalibrateRequest {
    context_key: String,
    #[serde(flatten)]
    justified: JustifiedRequest,
}

async fn equity_recalibrate(State(state): State<AppState>, Json(req): Json<RecalibrateRequest>) -> ApiResult {
    let key: ContextKey = req.context_key.parse()?;
    let actor = req.justified.actor.as_deref().unwrap_or(API_ACTOR);
    let applied = state
        .services
        .equity
        .apply(&key, actor, &req.justified.justification, Utc::now())
        .await?;
    envelope(applied)
}

// ---------------------------------------------------------------------------
// Anomaly model
// ---------------------------------------------------------------------------

async fn model_info(State(state): State<AppState>) -> ApiResult {
    envelope(state.services.registry.info())
}

async fn model_retrain(State(state): State<AppState>) -> ApiResult {
    envelope(state.services.trainer.train(Utc::now()).await?)
}
