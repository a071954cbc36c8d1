//! Periodic invocation of cluster-wide tasks.
//!
//! The scheduler and the reconciler are plain `run(now) -> effects` calls;
//! this runner is the timer that invokes them. Every invocation is isolated:
//! an error or a panic is logged and the next tick runs normally.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use syncwarden_core::Clock;

use crate::claims::ClaimStore;
use crate::error::DispatchError;
use crate::jobs::{JobQueue, JobStatusBackend};
use crate::lease::{LeaseOutcome, LeaseStore};
use crate::reconciler::{StuckJobReconciler, SweepReport};
use crate::scheduler::{BoundedScheduler, CycleReport};

use super::WorkerHandle;

/// What one invocation did.
#[derive(Debug, Clone)]
pub enum TaskEffects {
    /// Another instance holds the task's lease; nothing ran.
    LeaseNotObtained,
    Cycle(CycleReport),
    Sweep(SweepReport),
}

pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, now: DateTime<Utc>) -> Result<TaskEffects, DispatchError>;
}

impl<C, Q, B, L> PeriodicTask for BoundedScheduler<C, Q, B, L>
where
    C: ClaimStore,
    Q: JobQueue,
    B: JobStatusBackend,
    L: LeaseStore,
{
    fn name(&self) -> &str {
        &self.config().name
    }

    fn run(&self, now: DateTime<Utc>) -> Result<TaskEffects, DispatchError> {
        debug!(scheduler = %self.config().name, at = %now, "scheduler tick");
        Ok(match self.run_cycle()? {
            LeaseOutcome::Obtained(report) => TaskEffects::Cycle(report),
            LeaseOutcome::NotObtained => TaskEffects::LeaseNotObtained,
        })
    }
}

impl<C, B, L> PeriodicTask for StuckJobReconciler<C, B, L>
where
    C: ClaimStore,
    B: JobStatusBackend,
    L: LeaseStore,
{
    fn name(&self) -> &str {
        "stuck_job_reconciler"
    }

    fn run(&self, now: DateTime<Utc>) -> Result<TaskEffects, DispatchError> {
        debug!(at = %now, "reconciler tick");
        Ok(match self.run_sweep()? {
            LeaseOutcome::Obtained(report) => TaskEffects::Sweep(report),
            LeaseOutcome::NotObtained => TaskEffects::LeaseNotObtained,
        })
    }
}

#[derive(Debug)]
pub struct PeriodicRunner;

impl PeriodicRunner {
    /// Run `task` once, containing errors and panics.
    pub fn invoke(task: &dyn PeriodicTask, now: DateTime<Utc>) -> Option<TaskEffects> {
        match catch_unwind(AssertUnwindSafe(|| task.run(now))) {
            Ok(Ok(effects)) => Some(effects),
            Ok(Err(err)) if err.is_transient() => {
                warn!(task = task.name(), error = %err, "periodic task hit a transient error; retrying next tick");
                None
            }
            Ok(Err(err)) => {
                error!(task = task.name(), error = %err, "periodic task failed");
                None
            }
            Err(_) => {
                error!(task = task.name(), "periodic task panicked");
                None
            }
        }
    }

    /// Invoke `task` every `interval` on a dedicated thread until shutdown.
    pub fn spawn(
        task: Arc<dyn PeriodicTask>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = task.name().to_string();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(task = %name, interval_ms = interval_ms(interval), "periodic runner started");
                loop {
                    Self::invoke(task.as_ref(), clock.now());

                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                }
                info!(task = %name, "periodic runner stopped");
            })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn interval_ms(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}
