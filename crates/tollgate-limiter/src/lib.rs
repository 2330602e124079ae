//! # Tollgate Limiter
//!
//! Fixed-window admission control for model invocations.
//!
//! A [`RateLimiter`] evaluates a usage plan against three per-minute counters
//! (requests, input tokens, output tokens) held in a shared counter store, and
//! records actual consumption once a call completes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod result;
mod stats;
pub mod window;

pub use engine::{LimiterConfig, LimiterError, RateLimiter};
pub use result::{MetricUsage, RateLimitResult, RejectReason, UsageSnapshot};
pub use stats::{AdmissionStats, StatsSnapshot, TokenUsageSummary};
pub use window::FixedWindow;

pub use tollgate_core::clock::{Clock, ManualClock, SystemClock};
pub use tollgate_core::config::FailureMode;
