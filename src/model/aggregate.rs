//! Behavioral aggregates: per-entity summaries computed on demand from events.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, Duration, Timelike};
use serde::Serialize;

use super::entity::{EntityRef, EntityType, TimeWindow};
use super::event::{AuthEvent, AuthType, ServiceCategory};

/// Summary of a numeric distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSummary {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p95: f64,
    pub max: f64,
}

impl DistributionSummary {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            count,
            mean,
            std_dev: variance.sqrt(),
            median: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            max: sorted[count - 1],
        })
    }
}

/// Linear-interpolated percentile over an ascending slice. `q` in [0,1].
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Read-only behavioral summary for one entity over one window.
#[derive(Debug, Clone, Serialize)]
pub struct BehavioralAggregate {
    pub entity: EntityRef,
    pub window: TimeWindow,
    pub event_count: u64,
    pub window_hours: f64,
    /// Most events inside any one-hour span of the window.
    pub event_rate_per_hour: f64,
    /// Events per hour averaged over the whole window.
    pub mean_rate_per_hour: f64,
    pub distinct_regions: usize,
    /// Most distinct regions seen inside any one-hour span.
    pub peak_regions_per_hour: usize,
    pub auth_type_counts: BTreeMap<AuthType, u64>,
    pub fallback_count: u64,
    pub failure_count: u64,
    pub retries: Option<DistributionSummary>,
    pub session_duration_ms: Option<DistributionSummary>,
    /// Local (IST) hour-of-day histogram.
    pub hour_histogram: [u64; 24],
    /// Local day-of-week histogram, Monday first.
    pub weekday_histogram: [u64; 7],
    pub burstiness: Option<f64>,
    pub device_switches: u64,
    pub distinct_devices: usize,
    pub distinct_providers: usize,
    pub dominant_region: Option<String>,
    pub dominant_category: Option<ServiceCategory>,
}

/// Whether an event belongs to the entity.
pub fn event_matches(entity: &EntityRef, ev: &AuthEvent) -> bool {
    match entity.entity_type() {
        EntityType::Device => ev.device_hash.eq_ignore_ascii_case(entity.entity_id()),
        EntityType::Region => {
            let id = entity.entity_id();
            match id.split_once('-') {
                Some((state, district)) => {
                    ev.state_code == state && ev.district_code.as_deref() == Some(district)
                }
                None => ev.state_code == id,
            }
        }
        EntityType::ServiceProvider => ev.service_provider_id == entity.entity_id(),
    }
}

impl BehavioralAggregate {
    /// Build the aggregate from raw events. Events outside the window or not
    /// belonging to the entity are ignored.
    pub fn from_events(entity: EntityRef, window: TimeWindow, events: &[AuthEvent]) -> Self {
        let mut evs: Vec<&AuthEvent> = events
            .iter()
            .filter(|e| window.contains(e.timestamp) && event_matches(&entity, e))
            .collect();
        evs.sort_by_key(|e| e.timestamp);

        let event_count = evs.len() as u64;
        let window_hours = window.hours();
        let mean_rate_per_hour = event_count as f64 / window_hours.max(1.0);
        let event_rate_per_hour = peak_events_per_hour(&evs) as f64;

        let mut auth_type_counts = BTreeMap::new();
        let mut hour_histogram = [0u64; 24];
        let mut weekday_histogram = [0u64; 7];
        let mut region_counts: HashMap<&str, u64> = HashMap::new();
        let mut category_counts: BTreeMap<ServiceCategory, u64> = BTreeMap::new();
        let mut devices = HashSet::new();
        let mut providers = HashSet::new();
        let mut fallback_count = 0;
        let mut failure_count = 0;
        let mut retries = Vec::with_capacity(evs.len());
        let mut sessions = Vec::new();

        for ev in &evs {
            *auth_type_counts.entry(ev.auth_type).or_insert(0) += 1;
            let local = ev.local_time();
            hour_histogram[local.hour() as usize] += 1;
            weekday_histogram[local.weekday().num_days_from_monday() as usize] += 1;
            *region_counts.entry(ev.state_code.as_str()).or_insert(0) += 1;
            *category_counts.entry(ev.service_category).or_insert(0) += 1;
            devices.insert(ev.device_hash.to_ascii_lowercase());
            providers.insert(ev.service_provider_id.as_str());
            if ev.is_fallback {
                fallback_count += 1;
            }
            if ev.is_failure() {
                failure_count += 1;
            }
            retries.push(ev.retry_count as f64);
            if let Some(ms) = ev.session_duration_ms {
                sessions.push(ms as f64);
            }
        }

        let device_switches = evs
            .windows(2)
            .filter(|pair| !pair[0].device_hash.eq_ignore_ascii_case(&pair[1].device_hash))
            .count() as u64;

        // Ties resolve to the lexicographically smallest code so the result is stable.
        let dominant_region = region_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(code, _)| code.to_string());
        let dominant_category = category_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(c, _)| *c);

        Self {
            distinct_regions: region_counts.len(),
            peak_regions_per_hour: peak_regions_per_hour(&evs),
            auth_type_counts,
            fallback_count,
            failure_count,
            retries: DistributionSummary::from_values(&retries),
            session_duration_ms: DistributionSummary::from_values(&sessions),
            hour_histogram,
            weekday_histogram,
            burstiness: burstiness(&evs),
            device_switches,
            distinct_devices: devices.len(),
            distinct_providers: providers.len(),
            dominant_region,
            dominant_category,
            entity,
            window,
            event_count,
            window_hours,
            event_rate_per_hour,
            mean_rate_per_hour,
        }
    }

    fn share(&self, n: u64) -> Option<f64> {
        (self.event_count > 0).then(|| n as f64 / self.event_count as f64)
    }

    pub fn otp_fallback_share(&self) -> Option<f64> {
        self.share(self.fallback_count)
    }

    pub fn failure_share(&self) -> Option<f64> {
        self.share(self.failure_count)
    }

    /// Share of events between 23:00 and 05:59 local time.
    pub fn off_hours_share(&self) -> Option<f64> {
        let off: u64 = self
            .hour_histogram
            .iter()
            .enumerate()
            .filter(|(h, _)| *h >= 23 || *h <= 5)
            .map(|(_, c)| c)
            .sum();
        self.share(off)
    }

    pub fn weekend_share(&self) -> Option<f64> {
        self.share(self.weekday_histogram[5] + self.weekday_histogram[6])
    }

    /// OTP / (OTP + biometric). `None` when neither was used.
    pub fn otp_ratio(&self) -> Option<f64> {
        let otp = self.auth_type_counts.get(&AuthType::Otp).copied().unwrap_or(0);
        let bio = self
            .auth_type_counts
            .get(&AuthType::Biometric)
            .copied()
            .unwrap_or(0);
        (otp + bio > 0).then(|| otp as f64 / (otp + bio) as f64)
    }

    pub fn mean_retries(&self) -> Option<f64> {
        self.retries.as_ref().map(|r| r.mean)
    }

    pub fn median_session_ms(&self) -> Option<f64> {
        self.session_duration_ms.as_ref().map(|s| s.median)
    }

    /// Standard deviation of local event hours.
    pub fn hour_spread(&self) -> f64 {
        if self.event_count == 0 {
            return 0.0;
        }
        let n = self.event_count as f64;
        let mean = self
            .hour_histogram
            .iter()
            .enumerate()
            .map(|(h, c)| h as f64 * *c as f64)
            .sum::<f64>()
            / n;
        let var = self
            .hour_histogram
            .iter()
            .enumerate()
            .map(|(h, c)| (h as f64 - mean).powi(2) * *c as f64)
            .sum::<f64>()
            / n;
        var.sqrt()
    }

    /// Most frequent local hour, earliest on ties.
    pub fn dominant_hour(&self) -> Option<u32> {
        argmax(&self.hour_histogram).map(|h| h as u32)
    }

    /// Most frequent weekday (0 = Monday), earliest on ties.
    pub fn dominant_weekday(&self) -> Option<u32> {
        argmax(&self.weekday_histogram).map(|d| d as u32)
    }

    /// Device switches per consecutive event pair.
    pub fn device_switch_rate(&self) -> f64 {
        if self.event_count < 2 {
            return 0.0;
        }
        self.device_switches as f64 / (self.event_count - 1) as f64
    }

    /// Distinct providers per event.
    pub fn provider_diversity(&self) -> f64 {
        if self.event_count == 0 {
            return 0.0;
        }
        self.distinct_providers as f64 / self.event_count as f64
    }
}

fn argmax(hist: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, &c) in hist.iter().enumerate() {
        if c > 0 && best.map_or(true, |(_, b)| c > b) {
            best = Some((i, c));
        }
    }
    best.map(|(i, _)| i)
}

fn peak_events_per_hour(evs: &[&AuthEvent]) -> usize {
    let span = Duration::hours(1);
    let mut right = 0;
    let mut peak = 0;
    for left in 0..evs.len() {
        while right < evs.len() && evs[right].timestamp < evs[left].timestamp + span {
            right += 1;
        }
        peak = peak.max(right - left);
    }
    peak
}

fn peak_regions_per_hour(evs: &[&AuthEvent]) -> usize {
    let span = Duration::hours(1);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut right = 0;
    let mut peak = 0;
    for left in 0..evs.len() {
        while right < evs.len() && evs[right].timestamp < evs[left].timestamp + span {
            *counts.entry(evs[right].state_code.as_str()).or_insert(0) += 1;
            right += 1;
        }
        peak = peak.max(counts.len());
        let code = evs[left].state_code.as_str();
        if let Some(c) = counts.get_mut(code) {
            *c -= 1;
            if *c == 0 {
                counts.remove(code);
            }
        }
    }
    peak
}

/// Goh-Barabasi burstiness of inter-arrival gaps, in [-1, 1].
fn burstiness(evs: &[&AuthEvent]) -> Option<f64> {
    if evs.len() < 3 {
        return None;
    }
    let gaps: Vec<f64> = evs
        .windows(2)
        .map(|p| (p[1].timestamp - p[0].timestamp).num_milliseconds() as f64 / 1000.0)
        .collect();
    let n = gaps.len() as f64;
    let mean = gaps.iter().sum::<f64>() / n;
    let sd = (gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n).sqrt();
    if sd + mean <= f64::EPSILON {
        return Some(0.0);
    }
    Some((sd - mean) / (sd + mean))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::model::event::{local_offset, AuthStatus};

    pub const DEVICE: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";

    /// UTC instant for a local (IST) wall-clock time.
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
}
