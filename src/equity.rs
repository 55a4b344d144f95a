//! Equity guardrail: watches per-context false-positive rates.
//!
//! A context whose FALSE_POSITIVE ratio is well above the system-wide ratio
//! is flagged for recalibration. Applying a flag widens that context's
//! baseline tolerance. Alerts themselves are never suppressed here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::repository::ContextFeedback;
use crate::alerts::Feedback;
use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::baseline::{BaselineError, BaselineStore};
use crate::config::EquityConfig;
use crate::context::ContextKey;

#[derive(Debug, Error)]
pub enum EquityError {
    #[error("recalibration requires a non-empty justification")]
    MissingJustification,
    #[error(transparent)]
    Baseline(#[from] BaselineError),
    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

/// Messages from the alert manager.
#[derive(Debug, Clone)]
pub enum GuardrailEvent {
    AlertCreated { context_key: ContextKey },
    Feedback { context_key: ContextKey, feedback: Feedback },
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    alerts: u64,
    false_positives: u64,
}

impl Counts {
    fn ratio(&self) -> f64 {
        if self.alerts == 0 {
            0.0
        } else {
            self.false_positives as f64 / self.alerts as f64
        }
    }
}

#[derive(Default)]
struct Tally {
    /// Lifetime totals; drive the system-wide ratio.
    total: Counts,
    /// Since the last recalibration of this context; drive flagging.
    since_recalibration: Counts,
}

/// A pending recalibration request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalibrationFlag {
    pub context_key: ContextKey,
    pub alerts: u64,
    pub false_positives: u64,
    pub context_fp_ratio: f64,
    pub system_fp_ratio: f64,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recalibration {
    pub context_key: ContextKey,
    pub tolerance: f64,
    pub flag: Option<RecalibrationFlag>,
}

pub struct EquityGuardrail {
    config: EquityConfig,
    store: Arc<BaselineStore>,
    audit: Arc<AuditLog>,
    tallies: Mutex<HashMap<ContextKey, Tally>>,
    flags: Mutex<BTreeMap<ContextKey, RecalibrationFlag>>,
}

impl EquityGuardrail {
    pub fn new(config: EquityConfig, store: Arc<BaselineStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            store,
            audit,
            tallies: Mutex::new(HashMap::new()),
            flags: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load persisted per-context counts, typically at startup.
    pub fn seed(&self, rows: Vec<ContextFeedback>, now: DateTime<Utc>) {
        {
            let mut tallies = self.tallies.lock();
            for row in rows {
                let counts = Counts {
                    alerts: row.alerts,
                    false_positives: row.false_positives,
                };
                tallies.insert(
                    row.context_key,
                    Tally {
                        total: counts,
                        since_recalibration: counts,
                    },
                );
            }
        }
        self.reevaluate(now);
    }

    pub fn flags(&self) -> Vec<RecalibrationFlag> {
        self.flags.lock().values().cloned().collect()
    }

    fn system_ratio(tallies: &HashMap<ContextKey, Tally>) -> f64 {
        let (alerts, fps) = tallies.values().fold((0u64, 0u64), |(a, f), t| {
            (a + t.total.alerts, f + t.total.false_positives)
        });
        if alerts == 0 {
            0.0
        } else {
            fps as f64 / alerts as f64
        }
    }

    /// Recompute flags. Returns contexts newly flagged by this pass.
    fn reevaluate(&self, now: DateTime<Utc>) -> Vec<RecalibrationFlag> {
        let tallies = self.tallies.lock();
        let system = Self::system_ratio(&tallies);
        let mut flags = self.flags.lock();
        let mut fresh = Vec::new();

        for (key, tally) in tallies.iter() {
            let c = tally.since_recalibration;
            let over = system > 0.0
                && c.alerts >= self.config.min_alerts
                && c.ratio() > self.config.fp_ratio_multiplier * system;
            if !over {
                flags.remove(key);
                continue;
            }
            let flag = RecalibrationFlag {
                context_key: key.clone(),
                alerts: c.alerts,
                false_positives: c.false_positives,
                context_fp_ratio: c.ratio(),
                system_fp_ratio: system,
                flagged_at: flags.get(key).map_or(now, |f| f.flagged_at),
            };
            if !flags.contains_key(key) {
                fresh.push(flag.clone());
            }
            flags.insert(key.clone(), flag);
        }
        fresh
    }

    /// Fold one event and, with `auto_apply`, recalibrate newly flagged contexts.
    pub async fn observe(&self, event: GuardrailEvent, now: DateTime<Utc>) {
        {
            let mut tallies = self.tallies.lock();
            match &event {
                GuardrailEvent::AlertCreated { context_key } => {
                    let t = tallies.entry(context_key.clone()).or_default();
                    t.total.alerts += 1;
                    t.since_recalibration.alerts += 1;
                }
                GuardrailEvent::Feedback { context_key, feedback } => {
                    if *feedback == Feedback::FalsePositive {
                        let t = tallies.entry(context_key.clone()).or_default();
                        t.total.false_positives += 1;
                        t.since_recalibration.false_positives += 1;
                    }
                }
            }
        }

        for flag in self.reevaluate(now) {
            warn!(
                context = %flag.context_key,
                context_ratio = flag.context_fp_ratio,
                system_ratio = flag.system_fp_ratio,
                "context flagged for recalibration"
            );
            if self.config.auto_apply {
                let justification = format!(
                    "automatic: false-positive ratio {:.2} exceeds {:.2} x system ratio {:.2} over {} alerts",
                    flag.context_fp_ratio, self.config.fp_ratio_multiplier, flag.system_fp_ratio, flag.alerts
                );
                if let Err(e) = self.apply(&flag.context_key, "system", &justification, now).await {
                    warn!(context = %flag.context_key, error = %e, "automatic recalibration failed");
                }
            }
        }
    }

    /// Widen the context's tolerance by one step and clear its flag.
    pub async fn apply(
        &self,
        key: &ContextKey,
        actor: &str,
        justification: &str,
        now: DateTime<Utc>,
    ) -> Result<Recalibration, EquityError> {
        if justification.trim().is_empty() {
            return Err(EquityError::MissingJustification);
        }
        let tolerance = self
            .store
            .widen_tolerance(key, self.config.tolerance_step, self.config.max_tolerance, now)?;
        let flag = self.flags.lock().remove(key);
        if let Some(t) = self.tallies.lock().get_mut(key) {
            t.since_recalibration = Counts::default();
        }

        self.audit
            .log(
                AuditEntry::new(AuditEventType::ContextRecalibrated, actor)
                    .with_subject(key.to_string())
                    .with_justification(justification)
                    .with_params(json!({
                        "tolerance": tolerance,
                        "context_fp_ratio": flag.as_ref().map(|f| f.context_fp_ratio),
                        "system_fp_ratio": flag.as_ref().map(|f| f.system_fp_ratio),
                    })),
            )
            .await?;
        info!(context = %key, tolerance, actor, "context recalibrated");
        Ok(Recalibration {
            context_key: key.clone(),
            tolerance,
            flag,
        })
    }

    /// Consume alert-manager events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GuardrailEvent>) {
        while let Some(event) = rx.recv().await {
            self.observe(event, Utc::now()).await;
        }
        info!("equity guardrail channel closed");
    }
}
