//! `syncwarden-core`: primitives of the background dispatch layer.
//!
//! This crate contains **pure** types (no infrastructure concerns): identifiers,
//! the resource claim state machine, retry policy, configuration, and the clock.

pub mod claim;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod retry;

pub use claim::{ClaimState, ClaimTransition, Resource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, DataConsistency, DedupPolicy, HandlerConfig, ReconcilerConfig, SchedulerConfig,
    SyncwardenConfig,
};
pub use error::{CoreError, CoreResult};
pub use id::{BacklogSourceId, HandlerId, JobId, LeaseToken, ResourceId};
pub use retry::{BackoffStrategy, RetryPolicy};
