//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use amews::analysis::features::FeatureVector;
use amews::analysis::OutlierModel;
use amews::config::EngineConfig;
use amews::model::event::local_offset;
use amews::model::{AuthEvent, AuthStatus, AuthType, ServiceCategory};
use amews::services::Services;
use amews::storage::open_memory_pool;

pub const DEVICE: &str = "9f8e7d6c5b4a39281706f5e4d3c2b1a0";

/// UTC instant for an IST wall-clock time.
pub fn ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    let naive = NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(h, min, 0))
        .unwrap();
    local_offset()
        .from_local_datetime(&naive)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

/// An ordinary biometric banking authentication from `DEVICE` in MH.
pub fn event(ts: DateTime<Utc>) -> AuthEvent {
    AuthEvent {
        timestamp: ts,
        auth_type: AuthType::Biometric,
        service_category: ServiceCategory::Banking,
        service_provider_id: "AUA-001".to_string(),
        device_hash: DEVICE.to_string(),
        state_code: "MH".to_string(),
        district_code: None,
        retry_count: 0,
        is_fallback: false,
        status: AuthStatus::Success,
        session_duration_ms: Some(2_000),
    }
}

/// Small readiness thresholds so a couple of weeks of history suffice.
pub fn config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.baseline.window_days = 14;
    config.baseline.min_samples = 5;
    config.baseline.min_learning_days = 7;
    config.logging.audit_log_path = dir.join("audit.jsonl");
    config
}

pub async fn services(config: EngineConfig) -> Services {
    Services::build(config, open_memory_pool().unwrap()).await.unwrap()
}

/// One 10:15 IST event on each of `days`.
pub fn morning_history(days: &[(i32, u32, u32)]) -> Vec<AuthEvent> {
    days.iter().map(|&(y, m, d)| event(ist(y, m, d, 10, 15))).collect()
}

/// Weekdays of the fortnight before Monday 2024-03-04.
pub const WEEKDAY_HISTORY: [(i32, u32, u32); 9] = [
    (2024, 2, 20),
    (2024, 2, 21),
    (2024, 2, 22),
    (2024, 2, 23),
    (2024, 2, 26),
    (2024, 2, 27),
    (2024, 2, 28),
    (2024, 2, 29),
    (2024, 3, 1),
];

/// `count` events spread two minutes apart from `start`.
pub fn burst(start: DateTime<Utc>, count: usize) -> Vec<AuthEvent> {
    (0..count)
        .map(|i| event(start + chrono::Duration::minutes(2 * i as i64)))
        .collect()
}

/// 22 events in one hour across three states, 8 of them OTP fallbacks,
/// three retries each.
pub fn coordinated_burst(start: DateTime<Utc>) -> Vec<AuthEvent> {
    burst(start, 22)
        .into_iter()
        .enumerate()
        .map(|(i, mut ev)| {
            if i == 5 {
                ev.state_code = "KA".to_string();
            }
            if i == 9 {
                ev.state_code = "TN".to_string();
            }
            if i % 3 == 0 {
                ev.is_fallback = true;
                ev.auth_type = AuthType::Otp;
            }
            ev.retry_count = 3;
            ev
        })
        .collect()
}

pub struct FixedModel(pub f64);

impl OutlierModel for FixedModel {
    fn score(&self, _: &FeatureVector) -> (f64, f64) {
        (self.0, self.0)
    }
}

pub struct SlowModel(pub u64);

impl OutlierModel for SlowModel {
    fn score(&self, _: &FeatureVector) -> (f64, f64) {
        std::thread::sleep(Duration::from_millis(self.0));
        (1.0, 1.0)
    }
}

pub fn publish(services: &Services, model: impl OutlierModel + 'static) -> u64 {
    services.registry.publish(Arc::new(model), 100, Utc::now())
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
