//! Stuck-job reconciler.
//!
//! A periodic sweep over claims that have been `claimed` for longer than the
//! handler's staleness threshold. Their job ids are checked against the job
//! status backend in one bulk call per handler; claims whose job is no longer
//! queued or running are force-resolved. Live jobs are never touched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use syncwarden_core::{
    ClaimState, ClaimTransition, Clock, HandlerConfig, HandlerId, JobId, ReconcilerConfig,
    Resource, ResourceId,
};

use crate::claims::{ClaimQuery, ClaimStore};
use crate::error::DispatchError;
use crate::jobs::{HandlerRegistry, JobStatus, JobStatusBackend};
use crate::lease::{ExclusiveLeaseGuard, LeaseOutcome, LeaseStore, LeaseTtl};

pub const RECONCILER_LEASE_KEY: &str = "reconciler:stuck_jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanResolution {
    /// A success signal was recorded; the job finished its work.
    Completed,
    /// Strike limit reached.
    Failed,
    /// Returned to the backlog for another attempt.
    Reset,
}

/// The reconciler's corrective signal for one orphaned claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanDetected {
    pub handler: HandlerId,
    pub resource_id: ResourceId,
    pub job_id: JobId,
    pub status: JobStatus,
    pub resolution: OrphanResolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Stale claims whose job status was checked.
    pub examined: usize,
    /// Stale claims left alone because their job is still queued or running.
    pub live: usize,
    pub orphans: Vec<OrphanDetected>,
    /// Repairs that failed; those claims are picked up again next sweep.
    pub repair_errors: usize,
}

impl SweepReport {
    pub fn repaired(&self) -> usize {
        self.orphans.len()
    }
}

pub struct StuckJobReconciler<C, B, L> {
    config: ReconcilerConfig,
    handlers: Vec<(HandlerId, HandlerConfig)>,
    claims: C,
    status: B,
    leases: ExclusiveLeaseGuard<L>,
    clock: Arc<dyn Clock>,
}

impl<C, B, L> StuckJobReconciler<C, B, L>
where
    C: ClaimStore,
    B: JobStatusBackend,
    L: LeaseStore,
{
    pub fn new(
        config: ReconcilerConfig,
        claims: C,
        status: B,
        leases: L,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            claims,
            status,
            leases: ExclusiveLeaseGuard::new(leases),
            clock,
        }
    }

    /// Audit claims held by `handler` using its thresholds.
    pub fn watch(mut self, handler: HandlerId, config: HandlerConfig) -> Self {
        self.handlers.retain(|(id, _)| *id != handler);
        self.handlers.push((handler, config));
        self
    }

    /// Watch every registered handler.
    pub fn watch_registry(self, registry: &HandlerRegistry) -> Self {
        registry
            .iter()
            .fold(self, |rec, h| rec.watch(h.id.clone(), h.config.clone()))
    }

    /// Run one sweep if this instance wins the reconciler lease.
    #[instrument(skip(self))]
    pub fn run_sweep(&self) -> Result<LeaseOutcome<SweepReport>, DispatchError> {
        let ttl = LeaseTtl::from_duration(self.config.lease_timeout)?;

        match self
            .leases
            .with_lease(RECONCILER_LEASE_KEY, ttl, |_| self.sweep())?
        {
            LeaseOutcome::Obtained(report) => {
                let report = report?;
                info!(
                    examined = report.examined,
                    live = report.live,
                    repaired = report.repaired(),
                    repair_errors = report.repair_errors,
                    "stuck job sweep finished"
                );
                Ok(LeaseOutcome::Obtained(report))
            }
            LeaseOutcome::NotObtained => {
                debug!(lease_key = RECONCILER_LEASE_KEY, "another reconciler is active");
                Ok(LeaseOutcome::NotObtained)
            }
        }
    }

    fn sweep(&self) -> Result<SweepReport, DispatchError> {
        let started_at = self.clock.now();
        let mut report = SweepReport {
            started_at,
            finished_at: started_at,
            examined: 0,
            live: 0,
            orphans: Vec::new(),
            repair_errors: 0,
        };

        for (handler, handler_config) in &self.handlers {
            self.sweep_handler(handler, handler_config, &mut report)?;
        }

        report.finished_at = self.clock.now();
        Ok(report)
    }

    fn sweep_handler(
        &self,
        handler: &HandlerId,
        handler_config: &HandlerConfig,
        report: &mut SweepReport,
    ) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(handler_config.staleness_threshold)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.claims.find(
            &ClaimQuery::new(self.config.batch_size)
                .in_state(ClaimState::Claimed)
                .claimed_by(handler.clone())
                .dispatched_before(threshold),
        )?;
        if stale.is_empty() {
            return Ok(());
        }

        let job_ids: Vec<JobId> = stale
            .iter()
            .filter_map(|r| r.last_claimed_job_id.clone())
            .collect();
        let statuses: HashMap<JobId, JobStatus> = self.status.bulk_status(&job_ids)?;

        for resource in stale {
            let Some(job_id) = resource.last_claimed_job_id.clone() else {
                continue;
            };
            report.examined += 1;

            let status = statuses.get(&job_id).copied().unwrap_or(JobStatus::Unknown);
            if status.is_live() {
                report.live += 1;
                continue;
            }

            let (transition, resolution) = resolve(&resource, &job_id, status, handler_config, now);
            match self.claims.transition(resource.id, &transition) {
                Ok(_) => {
                    info!(
                        handler = %handler,
                        resource_id = %resource.id,
                        job_id = %job_id,
                        status = %status,
                        resolution = ?resolution,
                        "orphaned claim repaired"
                    );
                    report.orphans.push(OrphanDetected {
                        handler: handler.clone(),
                        resource_id: resource.id,
                        job_id,
                        status,
                        resolution,
                    });
                }
                Err(err) => {
                    warn!(
                        handler = %handler,
                        resource_id = %resource.id,
                        job_id = %job_id,
                        error = %err,
                        "failed to repair orphaned claim"
                    );
                    report.repair_errors += 1;
                }
            }
        }

        Ok(())
    }
}

/// Decide how to resolve a claim whose job is gone.
fn resolve(
    resource: &Resource,
    job_id: &JobId,
    status: JobStatus,
    config: &HandlerConfig,
    now: DateTime<Utc>,
) -> (ClaimTransition, OrphanResolution) {
    if resource.has_success_signal() {
        return (
            ClaimTransition::Complete {
                job_id: job_id.clone(),
            },
            OrphanResolution::Completed,
        );
    }

    let strikes = resource.failure_count.saturating_add(1);
    let reason = format!("orphaned: job {job_id} {status}");

    if strikes >= config.max_orphan_strikes {
        (
            ClaimTransition::Fail {
                job_id: job_id.clone(),
                reason,
                retry_at: config.retry.next_retry_at(strikes, now),
            },
            OrphanResolution::Failed,
        )
    } else {
        (
            ClaimTransition::ResetOrphan {
                job_id: job_id.clone(),
                reason,
            },
            OrphanResolution::Reset,
        )
    }
}

impl<C, B, L> core::fmt::Debug for StuckJobReconciler<C, B, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StuckJobReconciler")
            .field("config", &self.config)
            .field("handlers", &self.handlers.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
