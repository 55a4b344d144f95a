//! TOML configuration for the AMEWS risk engine.
//!
//! Layered model: compiled-in defaults, overridden section by section from a
//! TOML file located by `--config`, the `AMEWS_CONFIG` environment variable, or
//! `/etc/amews/amews.toml`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV_VAR: &str = "AMEWS_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/amews/amews.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the engine process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub rules: RuleThresholds,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub equity: EquityConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// An explicit path must load; otherwise fall back through
    /// `AMEWS_CONFIG`, the system path and finally the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `AMEWS_CONFIG` environment variable.
    /// 2. `/etc/amews/amews.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AMEWS_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if s.rule_weight < 0.0 || s.anomaly_weight < 0.0 {
            bail!("scoring weights must be non-negative");
        }
        if (s.rule_weight + s.anomaly_weight - 1.0).abs() > 1e-6 {
            bail!(
                "scoring weights must sum to 1.0 (rule {} + anomaly {})",
                s.rule_weight,
                s.anomaly_weight
            );
        }
        for (name, v) in [
            ("scoring.high_confidence", s.high_confidence),
            ("scoring.fallback_confidence_ceiling", s.fallback_confidence_ceiling),
            ("rules.otp_fallback_share", self.rules.otp_fallback_share),
            ("rules.off_hours_share", self.rules.off_hours_share),
            ("rules.failure_share", self.rules.failure_share),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must lie in [0, 1], got {}", name, v);
            }
        }
        if self.baseline.window_days == 0 || self.baseline.min_samples == 0 {
            bail!("baseline.window_days and baseline.min_samples must be positive");
        }
        if self.baseline.min_learning_days > self.baseline.window_days {
            bail!("baseline.min_learning_days cannot exceed baseline.window_days");
        }
        if self.anomaly.trees == 0 || self.anomaly.subsample < 2 {
            bail!("anomaly.trees must be positive and anomaly.subsample at least 2");
        }
        if self.equity.tolerance_step < 1.0 || self.equity.max_tolerance < 1.0 {
            bail!("equity tolerance settings must be >= 1.0");
        }
        if self.rules.session_min_ms >= self.rules.session_max_ms {
            bail!("rules.session_min_ms must be below rules.session_max_ms");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener and database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// SQLite database holding events, alerts and model versions.
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8095".to_string(),
            database_path: PathBuf::from("/var/lib/amews/amews.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Rolling window length; samples older than this are dropped.
    pub window_days: u32,
    /// Samples required before a context is READY.
    pub min_samples: u64,
    /// Learning age required before a context is READY.
    pub min_learning_days: u32,
    /// Ring capacity per context key.
    pub max_samples_per_key: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            min_samples: 100,
            min_learning_days: 14,
            max_samples_per_key: 20_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Trigger thresholds for the fixed rule set. Weights are not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleThresholds {
    /// Events per hour above which HIGH_FREQUENCY triggers.
    pub high_frequency_per_hour: f64,
    /// Distinct regions within one hour above which GEOGRAPHIC_VELOCITY triggers.
    pub max_regions_per_hour: usize,
    pub otp_fallback_share: f64,
    pub retry_avg: f64,
    pub off_hours_share: f64,
    pub failure_share: f64,
    pub session_min_ms: f64,
    pub session_max_ms: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            high_frequency_per_hour: 20.0,
            max_regions_per_hour: 2,
            otp_fallback_share: 0.30,
            retry_avg: 2.0,
            off_hours_share: 0.40,
            failure_share: 0.30,
            session_min_ms: 200.0,
            session_max_ms: 30_000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub rule_weight: f64,
    pub anomaly_weight: f64,
    /// Minimum confidence for the targeted CRITICAL action tiers.
    pub high_confidence: f64,
    /// Confidence cap when scoring falls back to rules only.
    pub fallback_confidence_ceiling: f64,
    pub scorer_timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            rule_weight: 0.6,
            anomaly_weight: 0.4,
            high_confidence: 0.7,
            fallback_confidence_ceiling: 0.6,
            scorer_timeout_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// Anomaly model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub trees: usize,
    pub subsample: usize,
    pub seed: u64,
    pub training_window_days: u32,
    pub min_training_vectors: usize,
    /// Upper bound on entity-hour aggregates pulled for one training run.
    pub max_training_vectors: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            subsample: 256,
            seed: 42,
            training_window_days: 14,
            min_training_vectors: 50,
            max_training_vectors: 20_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub dedup_window_hours: i64,
    pub suppress_while_learning: bool,
    pub max_update_retries: u32,
    /// Window used when `analyze` is called without one.
    pub default_window_hours: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_hours: 6,
            suppress_while_learning: true,
            max_update_retries: 3,
            default_window_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Equity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EquityConfig {
    pub fp_ratio_multiplier: f64,
    pub min_alerts: u64,
    pub tolerance_step: f64,
    pub max_tolerance: f64,
    pub auto_apply: bool,
}

impl Default for EquityConfig {
    fn default() -> Self {
        Self {
            fp_ratio_multiplier: 1.5,
            min_alerts: 10,
            tolerance_step: 1.25,
            max_tolerance: 2.0,
            auto_apply: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub query_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cron expressions use the 6-field format with a leading seconds column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub learning_cron: String,
    pub retrain_cron: String,
    pub sweep_cron: String,
    pub sweep_window_hours: i64,
    pub sweep_min_events: u64,
    pub sweep_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_cron: "0 5 * * * *".to_string(),
            retrain_cron: "0 30 2 * * *".to_string(),
            sweep_cron: "0 */15 * * * *".to_string(),
            sweep_window_hours: 1,
            sweep_min_events: 5,
            sweep_concurrency: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging and audit trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
    /// Path to the append-only JSON-lines audit log.
    pub audit_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            audit_log_path: PathBuf::from("/var/lib/amews/audit.jsonl"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());

        assert_eq!(cfg.server.bind, "127.0.0.1:8095");
        assert_eq!(cfg.baseline.window_days, 14);
        assert_eq!(cfg.baseline.min_samples, 100);
        assert_eq!(cfg.baseline.max_samples_per_key, 20_000);
        assert_eq!(cfg.rules.high_frequency_per_hour, 20.0);
        assert_eq!(cfg.rules.max_regions_per_hour, 2);
        assert_eq!(cfg.scoring.rule_weight, 0.6);
        assert_eq!(cfg.scoring.anomaly_weight, 0.4);
        assert_eq!(cfg.scoring.scorer_timeout_ms, 250);
        assert_eq!(cfg.anomaly.trees, 100);
        assert_eq!(cfg.anomaly.subsample, 256);
        assert_eq!(cfg.alerts.dedup_window_hours, 6);
        assert!(cfg.alerts.suppress_while_learning);
        assert_eq!(cfg.equity.fp_ratio_multiplier, 1.5);
        assert!(!cfg.equity.auto_apply);
        assert_eq!(cfg.source.query_timeout_ms, 2_000);
        assert_eq!(cfg.scheduler.learning_cron, "0 5 * * * *");
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[rules]
high_frequency_per_hour = 30.0

[equity]
auto_apply = true
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.rules.high_frequency_per_hour, 30.0);
        assert!(cfg.equity.auto_apply);
        assert_eq!(cfg.rules.retry_avg, 2.0);
        assert_eq!(cfg.baseline.min_samples, 100);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(cfg.server.bind, defaults.server.bind);
        assert_eq!(cfg.scheduler.retrain_cron, defaults.scheduler.retrain_cron);
        assert_eq!(cfg.anomaly.seed, defaults.anomaly.seed);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("amews.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9999"

[logging]
json = true
"#,
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9999");
        assert!(cfg.logging.json);

        let resolved = EngineConfig::resolve(Some(&path)).unwrap();
        assert_eq!(resolved.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(EngineConfig::load(Path::new("/nonexistent/path/amews.toml")).is_err());
        assert!(EngineConfig::resolve(Some(Path::new("/nonexistent/amews.toml"))).is_err());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.scoring.rule_weight = 0.9;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.rules.failure_share = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.baseline.min_learning_days = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.server.bind, back.server.bind);
        assert_eq!(cfg.equity.max_tolerance, back.equity.max_tolerance);
        assert_eq!(cfg.scheduler.sweep_cron, back.scheduler.sweep_cron);
    }
}
