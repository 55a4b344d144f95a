//! Context keys: the (region, service category, hour band, day type) buckets
//! that baselines are learned in.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::entity::validate_region_code;
use crate::model::{AuthEvent, BehavioralAggregate, ServiceCategory, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HourBand {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl HourBand {
    /// NIGHT 23-05, MORNING 06-11, AFTERNOON 12-17, EVENING 18-22.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => HourBand::Morning,
            12..=17 => HourBand::Afternoon,
            18..=22 => HourBand::Evening,
            _ => HourBand::Night,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HourBand::Night => "NIGHT",
            HourBand::Morning => "MORNING",
            HourBand::Afternoon => "AFTERNOON",
            HourBand::Evening => "EVENING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    /// `weekday` counts from Monday = 0.
    pub fn from_weekday(weekday: u32) -> Self {
        if weekday >= 5 {
            DayType::Weekend
        } else {
            DayType::Weekday
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DayType::Weekday => "WEEKDAY",
            DayType::Weekend => "WEEKEND",
        }
    }
}

/// Immutable baseline bucket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    region: String,
    category: ServiceCategory,
    hour_band: HourBand,
    day_type: DayType,
}

impl ContextKey {
    pub fn new(
        region: impl Into<String>,
        category: ServiceCategory,
        hour_band: HourBand,
        day_type: DayType,
    ) -> Result<Self, ValidationError> {
        let region = region.into();
        validate_region_code(&region)?;
        Ok(Self {
            region,
            category,
            hour_band,
            day_type,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn category(&self) -> ServiceCategory {
        self.category
    }

    pub fn hour_band(&self) -> HourBand {
        self.hour_band
    }

    pub fn day_type(&self) -> DayType {
        self.day_type
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.region,
            self.category,
            self.hour_band.as_str(),
            self.day_type.as_str()
        )
    }
}

impl FromStr for ContextKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ValidationError::InvalidField {
            field: "context_key",
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 4 {
            return Err(bad("expected REGION|CATEGORY|BAND|DAYTYPE"));
        }
        let hour_band = match parts[2] {
            "NIGHT" => HourBand::Night,
            "MORNING" => HourBand::Morning,
            "AFTERNOON" => HourBand::Afternoon,
            "EVENING" => HourBand::Evening,
            _ => return Err(bad("unknown hour band")),
        };
        let day_type = match parts[3] {
            "WEEKDAY" => DayType::Weekday,
            "WEEKEND" => DayType::Weekend,
            _ => return Err(bad("unknown day type")),
        };
        ContextKey::new(parts[0], parts[1].parse()?, hour_band, day_type)
    }
}

impl Serialize for ContextKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContextKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Maps events and aggregates to their context key.
pub struct ContextKeyResolver;

impl ContextKeyResolver {
    pub fn for_local_time(
        region: &str,
        category: ServiceCategory,
        local: DateTime<FixedOffset>,
    ) -> Result<ContextKey, ValidationError> {
        ContextKey::new(
            region,
            category,
            HourBand::from_hour(local.hour()),
            DayType::from_weekday(local.weekday().num_days_from_monday()),
        )
    }

    /// Events bucket by state, not district.
    pub fn for_event(event: &AuthEvent) -> Result<ContextKey, ValidationError> {
        Self::for_local_time(&event.state_code, event.service_category, event.local_time())
    }

    /// The bucket an aggregate is judged against: its dominant region,
    /// category, hour and weekday. `None` when the aggregate has no events.
    pub fn for_aggregate(aggregate: &BehavioralAggregate) -> Option<ContextKey> {
        let region = aggregate.dominant_region.as_deref()?;
        let category = aggregate.dominant_category?;
        let hour = aggregate.dominant_hour()?;
        let weekday = aggregate.dominant_weekday()?;
        ContextKey::new(
            region,
            category,
            HourBand::from_hour(hour),
            DayType::from_weekday(weekday),
        )
        .ok()
    }
}
