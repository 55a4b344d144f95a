//! Core data model: anonymized entities, events and behavioral aggregates.

pub mod aggregate;
pub mod entity;
pub mod event;

pub use aggregate::{BehavioralAggregate, DistributionSummary};
pub use entity::{EntityRef, EntityType, TimeWindow, ValidationError};
pub use event::{AuthEvent, AuthStatus, AuthType, ServiceCategory};
