//! Anonymized entity identifiers and evaluation windows.
//!
//! Every identifier that crosses into the engine is validated here. Device ids
//! must already be one-way hashes and regions are state/district codes; any id
//! shaped like a raw 12-digit Aadhaar number is refused outright.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest window an evaluation may cover.
pub const MAX_WINDOW_DAYS: i64 = 31;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("entity id is empty")]
    EmptyId,
    #[error("identifier has the shape of a raw Aadhaar number; only anonymized ids are accepted")]
    RawIdentifier,
    #[error("invalid {entity_type} id ({len} chars): {reason}")]
    InvalidId {
        entity_type: EntityType,
        len: usize,
        reason: &'static str,
    },
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Kind of entity an aggregate is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Device,
    Region,
    ServiceProvider,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Device,
        EntityType::Region,
        EntityType::ServiceProvider,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Device => "DEVICE",
            EntityType::Region => "REGION",
            EntityType::ServiceProvider => "SERVICE_PROVIDER",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DEVICE" => Ok(EntityType::Device),
            "REGION" => Ok(EntityType::Region),
            "SERVICE_PROVIDER" | "PROVIDER" => Ok(EntityType::ServiceProvider),
            _ => Err(ValidationError::UnknownEntityType(s.to_string())),
        }
    }
}

/// A validated (entity_type, entity_id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef {
    entity_type: EntityType,
    entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Result<Self, ValidationError> {
        let entity_id = entity_id.into();
        let entity_id = entity_id.trim().to_string();
        match entity_type {
            EntityType::Device => validate_device_hash(&entity_id)?,
            EntityType::Region => validate_region_code(&entity_id)?,
            EntityType::ServiceProvider => validate_provider_id(&entity_id)?,
        }
        // Hashes are case-insensitive; normalize so dedup keys line up.
        let entity_id = match entity_type {
            EntityType::Device => entity_id.to_ascii_lowercase(),
            _ => entity_id,
        };
        Ok(Self {
            entity_type,
            entity_id,
        })
    }

    pub fn device(hash: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(EntityType::Device, hash)
    }

    pub fn region(code: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(EntityType::Region, code)
    }

    pub fn provider(id: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(EntityType::ServiceProvider, id)
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// State-level region code for region entities (`MH-PUN` -> `MH`).
    pub fn state_code(&self) -> Option<&str> {
        match self.entity_type {
            EntityType::Region => self.entity_id.split('-').next(),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

fn reject_raw_identifier(id: &str) -> Result<(), ValidationError> {
    let digits_only: String = id.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if digits_only.len() == 12 && digits_only.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::RawIdentifier);
    }
    Ok(())
}

/// Device ids are one-way hashes: 16-128 hex characters.
pub fn validate_device_hash(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    reject_raw_identifier(id)?;
    let invalid = |reason| ValidationError::InvalidId {
        entity_type: EntityType::Device,
        len: id.len(),
        reason,
    };
    if !(16..=128).contains(&id.len()) {
        return Err(invalid("device hash must be 16-128 characters"));
    }
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("device hash must be hexadecimal"));
    }
    Ok(())
}

/// Region codes: two-letter state code, optionally `-` and a 1-4 char district.
pub fn validate_region_code(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    reject_raw_identifier(id)?;
    let invalid = |reason| ValidationError::InvalidId {
        entity_type: EntityType::Region,
        len: id.len(),
        reason,
    };
    let mut parts = id.splitn(2, '-');
    let state = parts.next().unwrap_or_default();
    if state.len() != 2 || !state.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(invalid("state code must be two uppercase letters"));
    }
    if let Some(district) = parts.next() {
        validate_district_code(district).map_err(|_| invalid("district code must be 1-4 uppercase alphanumerics"))?;
    }
    Ok(())
}

pub fn validate_district_code(code: &str) -> Result<(), ValidationError> {
    if (1..=4).contains(&code.len())
        && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        Ok(())
    } else {
        Err(ValidationError::InvalidField {
            field: "district_code",
            reason: "must be 1-4 uppercase alphanumerics".to_string(),
        })
    }
}

/// Provider ids: 1-64 characters of `[A-Za-z0-9_-]`.
pub fn validate_provider_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    reject_raw_identifier(id)?;
    if id.len() > 64 {
        return Err(ValidationError::InvalidId {
            entity_type: EntityType::ServiceProvider,
            len: id.len(),
            reason: "provider id must be at most 64 characters",
        });
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ValidationError::InvalidId {
            entity_type: EntityType::ServiceProvider,
            len: id.len(),
            reason: "provider id may only contain letters, digits, '_' and '-'",
        });
    }
    Ok(())
}

/// Half-open evaluation window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidWindow(format!(
                "end {} is not after start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        if end - start > Duration::days(MAX_WINDOW_DAYS) {
            return Err(ValidationError::InvalidWindow(format!(
                "window longer than {} days",
                MAX_WINDOW_DAYS
            )));
        }
        Ok(Self { start, end })
    }

    /// The `hours` leading up to `end`.
    pub fn trailing(end: DateTime<Utc>, hours: i64) -> Result<Self, ValidationError> {
        if hours <= 0 {
            return Err(ValidationError::InvalidWindow(format!(
                "window must cover at least one hour, got {}",
                hours
            )));
        }
        Self::new(end - Duration::hours(hours), end)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 3_600_000.0
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}
