//! # Tollgate Core
//!
//! Core types, configuration, and storage for Tollgate.
//!
//! This crate provides:
//! - Configuration loading and validation (JSON5 format)
//! - The usage plan data model and identifier validation
//! - Usage plan storage (in-memory and sled)
//! - Windowed counter storage (in-memory and Redis)
//! - Clock abstraction for deterministic window math

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod counters;
pub mod plans;
pub mod types;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, FailureMode};
pub use counters::{CounterError, CounterStore, MemoryCounterStore};
pub use plans::{MemoryPlanStore, PlanStore, PlanStoreError, SledPlanStore};
pub use types::{EntityType, Metric, ModelPermissions, PlanKey, RateLimits, TokenUsage, UsagePlan};
pub use validation::{ValidationError, validate_plan};

#[cfg(feature = "redis")]
pub use counters::RedisCounterStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::Clock;
    pub use crate::config::Config;
    pub use crate::counters::CounterStore;
    pub use crate::plans::PlanStore;
    pub use crate::types::*;
}
