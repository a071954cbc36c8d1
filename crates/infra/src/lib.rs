//! Dispatch and recovery mechanisms: leases, job submission and execution,
//! resource claims, the bounded scheduler and the stuck-job reconciler.

pub mod claims;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod reconciler;
pub mod scheduler;
pub mod workers;


pub use claims::{ClaimQuery, ClaimStore, ClaimStoreError, InMemoryClaimStore};
pub use error::DispatchError;
pub use jobs::{
    BackendError, Deduplicator, HandlerRegistry, InMemoryJobBackend, JobArgs, JobEnvelope,
    JobHandler, JobOutcome, JobQueue, JobRunner, JobSource, JobStatus, JobStatusBackend,
    JobWorker,
};
pub use lease::{ExclusiveLeaseGuard, InMemoryLeaseStore, Lease, LeaseError, LeaseOutcome, LeaseStore, LeaseTtl};
pub use reconciler::{OrphanDetected, OrphanResolution, StuckJobReconciler, SweepReport};
pub use scheduler::{BacklogSource, BoundedScheduler, CycleEnd, CycleReport, StoreBacklogSource};
pub use workers::{PeriodicRunner, PeriodicTask, TaskEffects, WorkerHandle};
