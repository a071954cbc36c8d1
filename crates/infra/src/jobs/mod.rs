//! Job submission and execution.
//!
//! ## Components
//!
//! - `JobQueue` / `JobStatusBackend` / `JobSource`: narrow contracts over the
//!   external queue broker, plus an in-memory backend
//! - `HandlerRegistry`: explicit mapping from handler id to implementation
//! - `Deduplicator`: `drop` / `reschedule_once` submission policies
//! - `enqueue_and_claim`: the submission step shared by the scheduler and
//!   the deduplicator
//! - `JobRunner`: executes one job under the per-resource lease and records
//!   the outcome on the resource claim
//! - `JobWorker`: polling loop around the runner

pub mod backend;
pub mod dedup;
#[cfg(feature = "redis")]
pub mod dedup_redis;
pub mod dispatch;
pub mod executor;
pub mod registry;
pub mod runner;
pub mod types;

pub use backend::{BackendError, InMemoryJobBackend, JobQueue, JobSource, JobStatusBackend};
pub use dedup::{
    DedupError, DedupKey, DedupStore, Deduplicator, InMemoryDedupStore, RescheduleRequest,
    SubmitOutcome, sorted_id_list,
};
#[cfg(feature = "redis")]
pub use dedup_redis::RedisDedupStore;
pub use dispatch::{Dispatched, enqueue_and_claim};
pub use executor::{Executed, JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerStats};
pub use registry::{
    FnHandler, HandlerRegistry, JobContext, JobHandler, RegisteredHandler, RegistryError,
    handler_fn,
};
pub use runner::{JobRunner, SharedDeduplicator, resource_lease_key};
pub use types::{JobArgs, JobEnvelope, JobOutcome, JobStatus, SkipReason};
