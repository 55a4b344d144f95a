//! Rolling per-context baseline store.
//!
//! Each context key keeps its samples in a time-ordered ring with a hard
//! cutoff at `now - window`. Running sums are maintained on push and drop;
//! percentiles are recomputed when a new snapshot is published. Readers only
//! ever see immutable `Arc<Baseline>` snapshots.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::stats::{MetricStats, RunningMoments};
use super::{
    Baseline, BaselineError, BaselineLookup, BaselineSample, BaselineState, LearningProgress,
    Metric,
};
use crate::config::BaselineConfig;
use crate::context::ContextKey;
use crate::model::BehavioralAggregate;

struct KeyState {
    ring: VecDeque<BaselineSample>,
    moments: [RunningMoments; 5],
    learning_started: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    version: u64,
    tolerance: f64,
}

impl KeyState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            ring: VecDeque::new(),
            moments: [RunningMoments::default(); 5],
            learning_started: None,
            last_updated: now,
            version: 0,
            tolerance: 1.0,
        }
    }

    fn fold(&mut self, sample: &BaselineSample, push: bool) {
        for m in Metric::ALL {
            if let Some(v) = m.sample_value(sample) {
                if push {
                    self.moments[m.index()].push(v);
                } else {
                    self.moments[m.index()].remove(v);
                }
            }
        }
    }

    fn insert(&mut self, sample: BaselineSample, capacity: usize) {
        if self.ring.is_empty() {
            self.learning_started = Some(sample.observed_at);
        } else if self.learning_started.map_or(true, |ls| sample.observed_at < ls) {
            self.learning_started = Some(sample.observed_at);
        }
        self.fold(&sample, true);
        let pos = self
            .ring
            .partition_point(|s| s.observed_at <= sample.observed_at);
        self.ring.insert(pos, sample);
        while self.ring.len() > capacity {
            if let Some(old) = self.ring.pop_front() {
                self.fold(&old, false);
            }
        }
    }

    /// Drop samples at or before `cutoff`. Returns how many were dropped.
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        while self.ring.front().is_some_and(|s| s.observed_at <= cutoff) {
            if let Some(old) = self.ring.pop_front() {
                self.fold(&old, false);
                dropped += 1;
            }
        }
        if self.ring.is_empty() {
            self.learning_started = None;
            self.moments = [RunningMoments::default(); 5];
        }
        dropped
    }
}

/// Concurrent rolling baseline store keyed by context.
pub struct BaselineStore {
    config: BaselineConfig,
    states: DashMap<ContextKey, KeyState>,
    snapshots: DashMap<ContextKey, Arc<Baseline>>,
}

impl BaselineStore {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    fn window(&self) -> Duration {
        Duration::days(self.config.window_days as i64)
    }

    fn required_age(&self) -> Duration {
        Duration::days(self.config.min_learning_days as i64)
    }

    fn is_ready(&self, sample_count: u64, learning_started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        sample_count >= self.config.min_samples
            && learning_started.is_some_and(|ls| now - ls >= self.required_age())
    }

    /// Fold one sample into the key's rolling window.
    pub fn update(&self, key: &ContextKey, sample: BaselineSample, now: DateTime<Utc>) -> Option<Arc<Baseline>> {
        self.update_many(key, std::iter::once(sample), now)
    }

    /// Fold a batch of samples and publish a single new snapshot. Samples
    /// already outside the window are ignored. Returns the published snapshot,
    /// or `None` when the key holds no samples afterwards.
    pub fn update_many(
        &self,
        key: &ContextKey,
        samples: impl IntoIterator<Item = BaselineSample>,
        now: DateTime<Utc>,
    ) -> Option<Arc<Baseline>> {
        let cutoff = now - self.window();
        let capacity = self.config.max_samples_per_key.max(1);

        let mut state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| KeyState::new(now));
        let mut added = 0usize;
        for sample in samples {
            if sample.observed_at <= cutoff || sample.observed_at > now {
                continue;
            }
            state.insert(sample, capacity);
            added += 1;
        }
        let dropped = state.prune(cutoff);
        if added == 0 && dropped == 0 && self.snapshots.contains_key(key) {
            return self.snapshots.get(key).map(|s| Arc::clone(s.value()));
        }
        state.version += 1;
        state.last_updated = now;
        debug!(context = %key, added, dropped, samples = state.ring.len(), "baseline updated");

        let published = self.publish_locked(key, &state, now);
        let empty = state.ring.is_empty();
        drop(state);
        if empty {
            self.untrack(key);
        }
        published
    }

    fn publish_locked(&self, key: &ContextKey, state: &KeyState, now: DateTime<Utc>) -> Option<Arc<Baseline>> {
        if state.ring.is_empty() {
            return None;
        }
        let mut metrics = BTreeMap::new();
        for m in Metric::ALL {
            let mut values: Vec<f64> = state.ring.iter().filter_map(|s| m.sample_value(s)).collect();
            if values.is_empty() {
                continue;
            }
            metrics.insert(m, MetricStats::from_moments(&state.moments[m.index()], &mut values));
        }
        let sample_count = state.ring.len() as u64;
        let was_ready = self
            .snapshots
            .get(key)
            .map(|s| s.state == BaselineState::Ready)
            .unwrap_or(false);
        let ready = self.is_ready(sample_count, state.learning_started, now);
        if ready && !was_ready {
            info!(context = %key, samples = sample_count, "baseline READY");
        }
        let baseline = Arc::new(Baseline {
            context_key: key.clone(),
            sample_count,
            metrics,
            window_start: now - self.window(),
            window_end: now,
            oldest_sample: state.ring.front().map(|s| s.observed_at),
            learning_started: state.learning_started,
            last_updated: state.last_updated,
            version: state.version,
            state: if ready { BaselineState::Ready } else { BaselineState::Learning },
            tolerance: state.tolerance,
        });
        self.snapshots.insert(key.clone(), Arc::clone(&baseline));
        Some(baseline)
    }

    fn untrack(&self, key: &ContextKey) {
        self.states.remove_if(key, |_, s| s.ring.is_empty());
        if !self.states.contains_key(key) {
            self.snapshots.remove(key);
            info!(context = %key, "baseline window emptied, context untracked");
        }
    }

    /// Drop aged-out samples for one key and republish if anything changed.
    fn refresh(&self, key: &ContextKey, now: DateTime<Utc>) -> Option<Arc<Baseline>> {
        self.update_many(key, std::iter::empty(), now)
    }

    /// Current snapshot for `key`, re-published first when its oldest sample
    /// has aged out or its readiness changed with the passage of time.
    pub fn snapshot(&self, key: &ContextKey, now: DateTime<Utc>) -> Option<Arc<Baseline>> {
        let snap = self.snapshots.get(key).map(|s| Arc::clone(s.value()))?;
        let cutoff = now - self.window();
        if snap.oldest_sample.map_or(true, |o| o <= cutoff) {
            return self.refresh(key, now);
        }
        let ready = self.is_ready(snap.sample_count, snap.learning_started, now);
        let current = snap.state == BaselineState::Ready;
        if ready != current {
            // Republish from the key state under its guard; a writer that
            // published after `snap` was read is never overwritten.
            let state = self.states.get(key)?;
            return self.publish_locked(key, &state, now);
        }
        Some(snap)
    }

    /// `Ready` only when the key has enough samples and enough learning age.
    /// An unknown or empty key is never given a default baseline.
    pub fn get(&self, key: &ContextKey, now: DateTime<Utc>) -> BaselineLookup {
        match self.snapshot(key, now) {
            Some(b) if b.state == BaselineState::Ready => BaselineLookup::Ready(b),
            Some(b) => BaselineLookup::NotReady(self.progress_of(&b, now)),
            None => BaselineLookup::NotReady(LearningProgress::new(
                Some(key.clone()),
                0,
                self.config.min_samples,
                0.0,
                self.required_age_hours(),
            )),
        }
    }

    fn required_age_hours(&self) -> f64 {
        self.required_age().num_seconds() as f64 / 3600.0
    }

    fn progress_of(&self, b: &Baseline, now: DateTime<Utc>) -> LearningProgress {
        let age_hours = b
            .learning_started
            .map(|ls| (now - ls).num_seconds().max(0) as f64 / 3600.0)
            .unwrap_or(0.0);
        LearningProgress::new(
            Some(b.context_key.clone()),
            b.sample_count,
            self.config.min_samples,
            age_hours,
            self.required_age_hours(),
        )
    }

    /// Progress for every tracked key, pruning stale ones first.
    pub fn progress_all(&self, now: DateTime<Utc>) -> Vec<LearningProgress> {
        let mut out: Vec<LearningProgress> = self
            .keys()
            .iter()
            .filter_map(|k| self.snapshot(k, now))
            .map(|b| self.progress_of(&b, now))
            .collect();
        out.sort_by(|a, b| a.context_key.cmp(&b.context_key));
        out
    }

    /// Every published snapshot, refreshed against `now`.
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<Arc<Baseline>> {
        let mut out: Vec<Arc<Baseline>> = self
            .keys()
            .iter()
            .filter_map(|k| self.snapshot(k, now))
            .collect();
        out.sort_by(|a, b| a.context_key.cmp(&b.context_key));
        out
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        self.snapshots.iter().map(|e| e.key().clone()).collect()
    }

    pub fn tracked(&self) -> usize {
        self.snapshots.len()
    }

    /// Widen a context's tolerance by `factor`, capped at `max`. Rule
    /// thresholds and deviation for the context both scale with it.
    /// Returns the new tolerance.
    pub fn widen_tolerance(
        &self,
        key: &ContextKey,
        factor: f64,
        max: f64,
        now: DateTime<Utc>,
    ) -> Result<f64, BaselineError> {
        if factor < 1.0 {
            return Err(BaselineError::InvalidFactor(factor));
        }
        let mut state = self
            .states
            .get_mut(key)
            .ok_or_else(|| BaselineError::UnknownContext(key.to_string()))?;
        state.tolerance = (state.tolerance * factor).min(max.max(1.0));
        state.version += 1;
        let tolerance = state.tolerance;
        self.publish_locked(key, &state, now);
        info!(context = %key, tolerance, "baseline tolerance widened");
        Ok(tolerance)
    }

    /// Mean over metrics of min(1, |z| / (4 * tolerance)). Explanatory only.
    pub fn deviation(baseline: &Baseline, aggregate: &BehavioralAggregate) -> f64 {
        let tolerance = baseline.tolerance.max(1.0);
        let terms: Vec<f64> = Metric::ALL
            .iter()
            .filter_map(|m| {
                let stats = baseline.metrics.get(m)?;
                let observed = m.observed(aggregate)?;
                let z = stats.z_score(observed).abs();
                Some(if z.is_finite() {
                    (z / (4.0 * tolerance)).min(1.0)
                } else {
                    1.0
                })
            })
            .collect();
        if terms.is_empty() {
            return 0.0;
        }
        terms.iter().sum::<f64>() / terms.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DayType, HourBand};
    use crate::model::ServiceCategory;

    fn key() -> ContextKey {
        ContextKey::new("MH", ServiceCategory::Banking, HourBand::Morning, DayType::Weekday).unwrap()
    }

    fn sample(at: DateTime<Utc>, rate: f64) -> BaselineSample {
        BaselineSample {
            observed_at: at,
            auth_rate: rate,
            failure_rate: 0.05,
            retry_avg: 0.2,
            session_duration_ms: Some(2_500.0),
            otp_ratio: 0.2,
        }
    }

    fn config() -> BaselineConfig {
        BaselineConfig::default()
    }

    /// `n` samples spread evenly over the `days` before `now`.
    fn history(now: DateTime<Utc>, days: i64, n: i64) -> Vec<BaselineSample> {
        let span = Duration::days(days).num_seconds();
        (0..n)
            .map(|i| sample(now - Duration::seconds(span - i * span / n), 5.0 + (i % 3) as f64))
            .collect()
    }

    #[test]
    fn test_unknown_key_not_ready() {
        let store = BaselineStore::new(config());
        match store.get(&key(), Utc::now()) {
            BaselineLookup::NotReady(p) => {
                assert_eq!(p.sample_count, 0);
                assert_eq!(p.completion, 0.0);
            }
            BaselineLookup::Ready(_) => panic!("unknown key must not be ready"),
        }
    }

    #[test]
    fn test_ready_needs_samples_and_age() {
        let now = Utc::now();
        let store = BaselineStore::new(config());

        // Enough samples, only two days old.
        store.update_many(&key(), history(now, 2, 200), now);
        match store.get(&key(), now) {
            BaselineLookup::NotReady(p) => {
                assert_eq!(p.sample_count, 200);
                assert!(p.completion > 0.1 && p.completion < 0.2);
            }
            BaselineLookup::Ready(_) => panic!("two days of history must not be ready"),
        }

        // Old enough, too few samples.
        let sparse = BaselineStore::new(config());
        sparse.update_many(&key(), history(now, 13, 50), now);
        assert!(matches!(sparse.get(&key(), now), BaselineLookup::NotReady(_)));

        // Thirteen days of history turns ready a day later; learning age is
        // kept even though the very first sample has aged out by then.
        let full = BaselineStore::new(config());
        full.update_many(&key(), history(now, 13, 150), now);
        assert!(matches!(full.get(&key(), now), BaselineLookup::NotReady(_)));
        let later = now + Duration::hours(25);
        match full.get(&key(), later) {
            BaselineLookup::Ready(b) => {
                assert_eq!(b.state, BaselineState::Ready);
                assert!(b.metrics.contains_key(&Metric::AuthRate));
            }
            BaselineLookup::NotReady(p) => panic!("expected ready, got {:?}", p),
        }
    }

    #[test]
    fn test_expires_after_window() {
        let now = Utc::now();
        let store = BaselineStore::new(config());
        store.update_many(&key(), history(now, 1, 150), now);
        assert_eq!(store.tracked(), 1);

        // Fifteen days later every sample has aged out.
        let later = now + Duration::days(15);
        assert!(matches!(store.get(&key(), later), BaselineLookup::NotReady(_)));
        assert_eq!(store.tracked(), 0);
        assert!(store.snapshots(later).is_empty());
    }

    #[test]
    fn test_stale_samples_ignored_and_capacity_enforced() {
        let now = Utc::now();
        let store = BaselineStore::new(BaselineConfig {
            max_samples_per_key: 10,
            ..config()
        });
        assert!(store
            .update(&key(), sample(now - Duration::days(20), 5.0), now)
            .is_none());
        store.update_many(&key(), history(now, 1, 25), now);
        let snap = store.snapshot(&key(), now).unwrap();
        assert_eq!(snap.sample_count, 10);
    }

    #[test]
    fn test_versions_increase_and_snapshots_are_immutable() {
        let now = Utc::now();
        let store = BaselineStore::new(config());
        let first = store.update(&key(), sample(now - Duration::hours(2), 5.0), now).unwrap();
        let second = store.update(&key(), sample(now - Duration::hours(1), 50.0), now).unwrap();
        assert!(second.version > first.version);
        assert_eq!(first.sample_count, 1);
        assert_eq!(second.sample_count, 2);
    }

    #[test]
    fn test_readiness_flip_never_hides_newer_samples() {
        let cfg = BaselineConfig {
            window_days: 60,
            min_samples: 5,
            min_learning_days: 7,
            ..BaselineConfig::default()
        };
        let store = Arc::new(BaselineStore::new(cfg));
        let t0 = Utc::now();
        let later = t0 + Duration::days(8);
        store.update_many(&key(), history(t0, 1, 10), t0);

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..300 {
                    // Each write publishes LEARNING as of `t0`.
                    store.update(&key(), sample(t0 - Duration::seconds(i), 5.0), t0);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..300 {
                        // Each read at `later` flips the snapshot to READY.
                        store.snapshot(&key(), later);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        let snap = store.snapshot(&key(), later).unwrap();
        assert_eq!(snap.state, BaselineState::Ready);
        assert_eq!(snap.sample_count, 310);
        assert_eq!(snap.version, 301);
    }

    #[test]
    fn test_widen_tolerance_caps() {
        let now = Utc::now();
        let store = BaselineStore::new(config());
        assert!(store.widen_tolerance(&key(), 1.25, 2.0, now).is_err());

        store.update(&key(), sample(now - Duration::hours(1), 5.0), now);
        assert_eq!(store.widen_tolerance(&key(), 1.25, 2.0, now).unwrap(), 1.25);
        for _ in 0..5 {
            store.widen_tolerance(&key(), 1.25, 2.0, now).unwrap();
        }
        assert_eq!(store.snapshot(&key(), now).unwrap().tolerance, 2.0);
        assert!(store.widen_tolerance(&key(), 0.5, 2.0, now).is_err());
    }
}
