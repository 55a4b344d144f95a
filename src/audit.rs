//! Append-only audit trail for every engine mutation.
//!
//! Alert state changes, analyst feedback, system-mode transitions, equity
//! recalibrations and model publications are appended as single JSON lines.
//! Writes are serialized through a `tokio::sync::Mutex` and the file is opened
//! in append mode so earlier records are never rewritten.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

// ---------------------------------------------------------------------------
// AuditEventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AlertCreated,
    /// A repeat evaluation folded into an open alert.
    AlertUpdated,
    AlertAcknowledged,
    AlertResolved,
    FeedbackRecorded,
    /// BASELINE_LEARNING -> ACTIVE_MONITORING.
    ModeTransition,
    /// Operator returned the system to BASELINE_LEARNING.
    ModeReset,
    ContextRecalibrated,
    ModelPublished,
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

/// A single audit log record. Fields not applicable to an event are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp of the event.
    pub timestamp: String,
    pub event_type: AuditEventType,
    /// Analyst, operator or `system` for automatic actions.
    pub actor: String,
    /// Alert id, context key or model version the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            actor: actor.into(),
            subject: None,
            from_state: None,
            to_state: None,
            justification: None,
            params: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Record a state change `from -> to`.
    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state = Some(from.into());
        self.to_state = Some(to.into());
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only audit log backed by a JSON-lines file.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl AuditLog {
    /// Open (or create) the audit log file at `path` in append mode.
    pub async fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        debug!(path = %path.display(), "audit log opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append a single audit entry as a JSON line.
    pub async fn log(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("failed to serialize audit entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to audit log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush audit log: {}", self.path.display()))?;

        Ok(())
    }

    /// Read every entry back, oldest first.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read audit log: {}", self.path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("malformed audit line"))
            .collect()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
