//! Anonymized authentication event records as delivered by the event store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{
    validate_device_hash, validate_district_code, validate_provider_id, validate_region_code,
    ValidationError,
};

/// Events are bucketed by Indian Standard Time (UTC+05:30).
pub const LOCAL_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(LOCAL_OFFSET_SECS).unwrap_or(Utc.fix())
}

/// Convert a UTC timestamp into local (IST) wall-clock time.
pub fn to_local(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.with_timezone(&local_offset())
}

/// Start of the local clock hour containing `ts`, as a UTC instant.
pub fn local_hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let offset = LOCAL_OFFSET_SECS as i64;
    let shifted = ts.timestamp() + offset;
    let floored = shifted - shifted.rem_euclid(3600) - offset;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    Otp,
    Biometric,
    Demographic,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Otp => "OTP",
            AuthType::Biometric => "BIOMETRIC",
            AuthType::Demographic => "DEMOGRAPHIC",
        }
    }
}

impl FromStr for AuthType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OTP" => Ok(AuthType::Otp),
            "BIOMETRIC" => Ok(AuthType::Biometric),
            "DEMOGRAPHIC" => Ok(AuthType::Demographic),
            other => Err(ValidationError::InvalidField {
                field: "auth_type",
                reason: format!("unknown auth type '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceCategory {
    Banking,
    Telecom,
    Welfare,
    Healthcare,
    Government,
    Insurance,
    Education,
}

impl ServiceCategory {
    pub const ALL: [ServiceCategory; 7] = [
        ServiceCategory::Banking,
        ServiceCategory::Telecom,
        ServiceCategory::Welfare,
        ServiceCategory::Healthcare,
        ServiceCategory::Government,
        ServiceCategory::Insurance,
        ServiceCategory::Education,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceCategory::Banking => "BANKING",
            ServiceCategory::Telecom => "TELECOM",
            ServiceCategory::Welfare => "WELFARE",
            ServiceCategory::Healthcare => "HEALTHCARE",
            ServiceCategory::Government => "GOVERNMENT",
            ServiceCategory::Insurance => "INSURANCE",
            ServiceCategory::Education => "EDUCATION",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidField {
                field: "service_category",
                reason: format!("unknown service category '{}'", s),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Success,
    Failure,
}

impl AuthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::Success => "SUCCESS",
            AuthStatus::Failure => "FAILURE",
        }
    }
}

impl FromStr for AuthStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(AuthStatus::Success),
            "FAILURE" => Ok(AuthStatus::Failure),
            other => Err(ValidationError::InvalidField {
                field: "status",
                reason: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// One anonymized authentication event.
///
/// Unknown fields are rejected at deserialization so identity or biometric
/// payloads cannot ride along with behavioral metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthEvent {
    pub timestamp: DateTime<Utc>,
    pub auth_type: AuthType,
    pub service_category: ServiceCategory,
    pub service_provider_id: String,
    pub device_hash: String,
    pub state_code: String,
    #[serde(default)]
    pub district_code: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub is_fallback: bool,
    pub status: AuthStatus,
    #[serde(default)]
    pub session_duration_ms: Option<u64>,
}

impl AuthEvent {
    /// Enforce the anonymization invariant on every identifying field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_device_hash(&self.device_hash)?;
        validate_region_code(&self.state_code)?;
        if self.state_code.contains('-') {
            return Err(ValidationError::InvalidField {
                field: "state_code",
                reason: "state code must not carry a district suffix".to_string(),
            });
        }
        if let Some(district) = &self.district_code {
            validate_district_code(district)?;
        }
        validate_provider_id(&self.service_provider_id)?;
        if self.retry_count > 100 {
            return Err(ValidationError::InvalidField {
                field: "retry_count",
                reason: format!("{} exceeds 100", self.retry_count),
            });
        }
        Ok(())
    }

    pub fn local_time(&self) -> DateTime<FixedOffset> {
        to_local(self.timestamp)
    }

    pub fn is_failure(&self) -> bool {
        self.status == AuthStatus::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "timestamp": "2024-03-04T18:45:00Z",
            "auth_type": "BIOMETRIC",
            "service_category": "BANKING",
            "service_provider_id": "AUA-001",
            "device_hash": "0f1e2d3c4b5a69788796a5b4c3d2e1f0",
            "state_code": "MH",
            "district_code": "PUN",
            "retry_count": 1,
            "is_fallback": false,
            "status": "SUCCESS",
            "session_duration_ms": 1200
        })
    }

    #[test]
    fn test_event_parses_and_validates() {
        let ev: AuthEvent = serde_json::from_value(sample_json()).unwrap();
        assert!(ev.validate().is_ok());
        // 18:45 UTC is 00:15 IST the next day.
        assert_eq!(ev.local_time().hour(), 0);
    }

    #[test]
    fn test_identity_fields_rejected() {
        let mut json = sample_json();
        json["aadhaar_number"] = serde_json::json!("123412341234");
        assert!(serde_json::from_value::<AuthEvent>(json).is_err());

        let mut json = sample_json();
        json["fingerprint_template"] = serde_json::json!("AAEC");
        assert!(serde_json::from_value::<AuthEvent>(json).is_err());
    }

    #[test]
    fn test_raw_number_in_device_hash_rejected() {
        let mut ev: AuthEvent = serde_json::from_value(sample_json()).unwrap();
        ev.device_hash = "987654321098".to_string();
        assert_eq!(ev.validate().unwrap_err(), ValidationError::RawIdentifier);
    }

    #[test]
    fn test_local_hour_start_aligns_to_ist() {
        let ts = DateTime::parse_from_rfc3339("2024-03-04T18:45:10Z")
            .unwrap()
            .with_timezone(&Utc);
        // 00:15 IST -> 00:00 IST -> 18:30 UTC.
        assert_eq!(
            local_hour_start(ts).to_rfc3339(),
            "2024-03-04T18:30:00+00:00"
        );
    }

    #[test]
    fn test_category_round_trip_strings() {
        for c in ServiceCategory::ALL {
            assert_eq!(c.as_str().parse::<ServiceCategory>().unwrap(), c);
        }
    }
}
