//! Bounded-capacity scheduler.
//!
//! One cycle runs under a cluster-wide lease and loops
//! `LOAD_BACKLOG → DISPATCH` until capacity is reached, the backlog is empty,
//! the job backend or claim store goes away, or the `run_time` budget is
//! spent. Candidates from all backlog sources are merged round-robin so no
//! source starves the others. A resource whose dispatch fails is set aside
//! for the rest of the cycle and the next candidate takes its slot.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use syncwarden_core::{ClaimState, Clock, JobId, ResourceId, SchedulerConfig};

use crate::claims::{ClaimQuery, ClaimStore};
use crate::error::DispatchError;
use crate::jobs::{
    Dispatched, HandlerRegistry, JobArgs, JobQueue, JobStatusBackend, RegisteredHandler,
    SharedDeduplicator, SubmitOutcome, enqueue_and_claim,
};
use crate::lease::{ExclusiveLeaseGuard, LeaseOutcome, LeaseStore, LeaseTtl};

pub mod backlog;

pub use backlog::{
    BacklogError, BacklogSource, StoreBacklogKind, StoreBacklogSource, interleave, num_to_schedule,
};

/// A job dispatched (or found in flight) during the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJobRecord {
    pub resource_id: ResourceId,
    pub job_id: JobId,
    pub dispatched_at: DateTime<Utc>,
}

/// Why a cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEnd {
    CapacityReached,
    BacklogEmpty,
    TimeBudgetExceeded,
    /// The job backend or claim store became unavailable mid-round.
    DispatchStalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub scheduler: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Newly dispatched jobs, in dispatch order.
    pub dispatched: Vec<ScheduledJobRecord>,
    /// Resources whose dispatch failed this cycle; they stay eligible.
    pub failed_dispatches: Vec<ResourceId>,
    /// Resources passed over because an equal job is already outstanding.
    pub deduplicated: Vec<ResourceId>,
    pub in_flight_at_start: usize,
    pub in_flight_at_end: usize,
    pub backlog_loads: usize,
    pub end: CycleEnd,
}

impl CycleReport {
    pub fn dispatched_ids(&self) -> Vec<ResourceId> {
        self.dispatched.iter().map(|r| r.resource_id).collect()
    }
}

pub struct BoundedScheduler<C, Q, B, L> {
    config: SchedulerConfig,
    sources: Vec<Box<dyn BacklogSource>>,
    claims: C,
    queue: Q,
    status: B,
    leases: ExclusiveLeaseGuard<L>,
    dedup: Option<(SharedDeduplicator, RegisteredHandler)>,
    clock: Arc<dyn Clock>,
}

impl<C, Q, B, L> BoundedScheduler<C, Q, B, L>
where
    C: ClaimStore,
    Q: JobQueue,
    B: JobStatusBackend,
    L: LeaseStore,
{
    pub fn new(
        config: SchedulerConfig,
        claims: C,
        queue: Q,
        status: B,
        leases: L,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            config,
            sources: Vec::new(),
            claims,
            queue,
            status,
            leases: ExclusiveLeaseGuard::new(leases),
            dedup: None,
            clock,
        })
    }

    pub fn with_source<S: BacklogSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Submit through `dedup`, so scheduled jobs hold the dedup marker of
    /// their resource like any other deduplicated submission.
    pub fn with_dedup(
        mut self,
        dedup: SharedDeduplicator,
        registry: &HandlerRegistry,
    ) -> Result<Self, DispatchError> {
        let registered = registry.resolve(self.config.handler.as_str())?.clone();
        self.dedup = Some((dedup, registered));
        Ok(self)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one cycle if this instance wins the scheduler lease.
    #[instrument(skip(self), fields(scheduler = %self.config.name))]
    pub fn run_cycle(&self) -> Result<LeaseOutcome<CycleReport>, DispatchError> {
        let ttl = LeaseTtl::from_duration(self.config.lease_timeout)?;
        let key = self.config.lease_key();

        match self.leases.with_lease(&key, ttl, |_| self.cycle())? {
            LeaseOutcome::Obtained(report) => {
                let report = report?;
                info!(
                    scheduler = %self.config.name,
                    dispatched = report.dispatched.len(),
                    failed = report.failed_dispatches.len(),
                    deduplicated = report.deduplicated.len(),
                    in_flight = report.in_flight_at_end,
                    end = ?report.end,
                    "scheduler cycle finished"
                );
                Ok(LeaseOutcome::Obtained(report))
            }
            LeaseOutcome::NotObtained => {
                debug!(scheduler = %self.config.name, lease_key = %key, "another scheduler is active");
                Ok(LeaseOutcome::NotObtained)
            }
        }
    }

    fn cycle(&self) -> Result<CycleReport, DispatchError> {
        let started_at = self.clock.now();
        let deadline = chrono::Duration::from_std(self.config.run_time)
            .ok()
            .and_then(|budget| started_at.checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut in_flight = self.seed_in_flight()?;
        let in_flight_at_start = in_flight.len();
        let mut pending: VecDeque<ResourceId> = VecDeque::new();
        let mut skipped: BTreeSet<ResourceId> = BTreeSet::new();
        let mut deduplicated: BTreeSet<ResourceId> = BTreeSet::new();
        let mut dispatched: Vec<ScheduledJobRecord> = Vec::new();
        let mut backlog_loads = 0;

        let end = loop {
            if self.clock.now() >= deadline {
                break CycleEnd::TimeBudgetExceeded;
            }

            self.refresh_in_flight(&mut in_flight);
            if self.config.max_capacity <= in_flight.len() {
                break CycleEnd::CapacityReached;
            }

            if pending.is_empty() {
                let mut exclude: BTreeSet<ResourceId> = in_flight.keys().copied().collect();
                exclude.extend(skipped.iter().copied());
                exclude.extend(deduplicated.iter().copied());
                exclude.extend(dispatched.iter().map(|r| r.resource_id));

                pending = self.load_backlog(&exclude).into();
                backlog_loads += 1;
                if pending.is_empty() {
                    break CycleEnd::BacklogEmpty;
                }
            }

            let n = num_to_schedule(self.config.max_capacity, in_flight.len(), pending.len());
            let mut scheduled = 0;
            let mut stalled = false;

            while scheduled < n {
                let Some(resource_id) = pending.pop_front() else {
                    break;
                };
                match self.dispatch(resource_id) {
                    Ok(Some(record)) => {
                        in_flight.insert(resource_id, record.job_id.clone());
                        dispatched.push(record);
                        scheduled += 1;
                    }
                    Ok(None) => {
                        deduplicated.insert(resource_id);
                    }
                    Err(err) if err.is_transient() => {
                        warn!(
                            scheduler = %self.config.name,
                            resource_id = %resource_id,
                            error = %err,
                            "dispatch infrastructure unavailable; ending cycle"
                        );
                        skipped.insert(resource_id);
                        stalled = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            scheduler = %self.config.name,
                            resource_id = %resource_id,
                            error = %err,
                            "dispatch failed; resource stays eligible"
                        );
                        skipped.insert(resource_id);
                    }
                }
            }

            if stalled {
                break CycleEnd::DispatchStalled;
            }
        };

        Ok(CycleReport {
            scheduler: self.config.name.clone(),
            started_at,
            finished_at: self.clock.now(),
            dispatched,
            failed_dispatches: skipped.into_iter().collect(),
            deduplicated: deduplicated.into_iter().collect(),
            in_flight_at_start,
            in_flight_at_end: in_flight.len(),
            backlog_loads,
            end,
        })
    }

    /// Jobs already claimed for this handler count against capacity.
    fn seed_in_flight(&self) -> Result<HashMap<ResourceId, JobId>, DispatchError> {
        let query = ClaimQuery::new(usize::MAX)
            .in_state(ClaimState::Claimed)
            .claimed_by(self.config.handler.clone());

        Ok(self
            .claims
            .find(&query)?
            .into_iter()
            .filter_map(|r| r.last_claimed_job_id.map(|job| (r.id, job)))
            .collect())
    }

    /// Drop jobs the backend no longer reports as queued or running. If the
    /// backend cannot answer, the working set is kept as is.
    fn refresh_in_flight(&self, in_flight: &mut HashMap<ResourceId, JobId>) {
        if in_flight.is_empty() {
            return;
        }

        let job_ids: Vec<JobId> = in_flight.values().cloned().collect();
        match self.status.bulk_status(&job_ids) {
            Ok(statuses) => {
                in_flight.retain(|_, job| statuses.get(job).is_some_and(|s| s.is_live()));
            }
            Err(err) => {
                warn!(
                    scheduler = %self.config.name,
                    error = %err,
                    "job status backend unavailable; assuming all tracked jobs are live"
                );
            }
        }
    }

    fn load_backlog(&self, exclude: &BTreeSet<ResourceId>) -> Vec<ResourceId> {
        let now = self.clock.now();
        let batches: Vec<Vec<ResourceId>> = self
            .sources
            .iter()
            .map(|source| {
                match source.load(self.config.db_retrieve_batch_size, exclude, now) {
                    Ok(ids) => {
                        debug!(source = %source.id(), candidates = ids.len(), "backlog loaded");
                        ids
                    }
                    Err(err) => {
                        warn!(source = %source.id(), error = %err, "backlog source failed; skipping");
                        Vec::new()
                    }
                }
            })
            .collect();

        let mut seen = HashSet::new();
        interleave(batches)
            .into_iter()
            .filter(|id| !exclude.contains(id) && seen.insert(*id))
            .collect()
    }

    /// `None` when the deduplicator passed over the resource.
    fn dispatch(&self, resource_id: ResourceId) -> Result<Option<ScheduledJobRecord>, DispatchError> {
        let args = JobArgs::for_resource(resource_id);
        let outcome = match &self.dedup {
            None => SubmitOutcome::Enqueued(self.submit(&args)?),
            Some((dedup, registered)) => {
                dedup.submit_with(registered, &args, |args| self.submit(args))?
            }
        };

        match outcome {
            SubmitOutcome::Enqueued(Dispatched {
                job_id,
                dispatched_at,
            }) => {
                debug!(
                    scheduler = %self.config.name,
                    resource_id = %resource_id,
                    job_id = %job_id,
                    "dispatched"
                );
                Ok(Some(ScheduledJobRecord {
                    resource_id,
                    job_id,
                    dispatched_at,
                }))
            }
            SubmitOutcome::Dropped | SubmitOutcome::Deferred => {
                debug!(
                    scheduler = %self.config.name,
                    resource_id = %resource_id,
                    "equal job outstanding; not dispatched"
                );
                Ok(None)
            }
        }
    }

    fn submit(&self, args: &JobArgs) -> Result<Dispatched, DispatchError> {
        enqueue_and_claim(
            &self.queue,
            &self.claims,
            self.clock.as_ref(),
            &self.config.handler,
            args,
        )
    }
}

impl<C, Q, B, L> core::fmt::Debug for BoundedScheduler<C, Q, B, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundedScheduler")
            .field("config", &self.config)
            .field("sources", &self.sources.iter().map(|s| s.id().to_string()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use syncwarden_core::{
        BacklogSourceId, DataConsistency, DedupPolicy, HandlerConfig, HandlerId, ManualClock,
        Resource,
    };

    use super::*;
    use crate::claims::InMemoryClaimStore;
    use crate::jobs::{
        DedupKey, DedupStore, Deduplicator, InMemoryDedupStore, InMemoryJobBackend, JobStatus,
        handler_fn,
    };
    use crate::lease::InMemoryLeaseStore;

    type TestScheduler = BoundedScheduler<
        Arc<InMemoryClaimStore>,
        Arc<InMemoryJobBackend>,
        Arc<InMemoryJobBackend>,
        Arc<InMemoryLeaseStore>,
    >;

    struct Fixture {
        clock: ManualClock,
        claims: Arc<InMemoryClaimStore>,
        backend: Arc<InMemoryJobBackend>,
        leases: Arc<InMemoryLeaseStore>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        Fixture {
            claims: Arc::new(InMemoryClaimStore::new(Arc::new(clock.clone()))),
            backend: Arc::new(InMemoryJobBackend::new(Arc::new(clock.clone()))),
            leases: Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone()))),
            clock,
        }
    }

    impl Fixture {
        fn seed(&self, source: &str, ids: impl IntoIterator<Item = i64>) {
            let source = BacklogSourceId::new(source).unwrap();
            for id in ids {
                self.claims
                    .insert(Resource::new(ResourceId::new(id), source.clone(), self.clock.now()))
                    .unwrap();
            }
        }

        fn scheduler(&self, capacity: usize, sources: &[&str]) -> TestScheduler {
            let config = SchedulerConfig::new("file_sync", HandlerId::new("geo.file_sync").unwrap())
                .with_max_capacity(capacity);
            let mut scheduler = BoundedScheduler::new(
                config,
                self.claims.clone(),
                self.backend.clone(),
                self.backend.clone(),
                self.leases.clone(),
                Arc::new(self.clock.clone()),
            )
            .unwrap();
            for source in sources {
                scheduler = scheduler.with_source(StoreBacklogSource::idle(
                    BacklogSourceId::new(*source).unwrap(),
                    self.claims.clone(),
                ));
            }
            scheduler
        }

        fn dedup(&self, policy: DedupPolicy) -> (SharedDeduplicator, HandlerRegistry) {
            let mut registry = HandlerRegistry::new();
            registry
                .register(
                    HandlerId::new("geo.file_sync").unwrap(),
                    handler_fn(|_, _| Ok(())),
                    HandlerConfig {
                        dedup_policy: policy,
                        ..HandlerConfig::default()
                    },
                )
                .unwrap();
            let queue: Arc<dyn JobQueue> = self.backend.clone();
            let store: Arc<dyn DedupStore> = Arc::new(InMemoryDedupStore::new(Arc::new(self.clock.clone())));
            let dedup = Deduplicator::new(queue, store)
                .with_claims(self.claims.clone(), Arc::new(self.clock.clone()));
            (Arc::new(dedup), registry)
        }

        fn state(&self, id: i64) -> ClaimState {
            self.claims
                .get(ResourceId::new(id), DataConsistency::Strong)
                .unwrap()
                .unwrap()
                .claim_state
        }
    }

    fn obtained(outcome: LeaseOutcome<CycleReport>) -> CycleReport {
        outcome.into_option().expect("lease should be obtained")
    }

    fn dedup_key(registry: &HandlerRegistry, id: i64) -> DedupKey {
        let registered = registry.resolve("geo.file_sync").unwrap();
        DedupKey::derive(
            &registered.id,
            registered.handler.as_ref(),
            &JobArgs::for_resource(ResourceId::new(id)),
        )
        .unwrap()
    }

    #[test]
    fn empty_backlog_ends_cycle_without_dispatch() {
        let fx = fixture();
        let report = obtained(fx.scheduler(5, &["unsynced"]).run_cycle().unwrap());
        assert!(report.dispatched.is_empty());
        assert_eq!(report.end, CycleEnd::BacklogEmpty);
    }

    #[test]
    fn skips_cycle_while_another_scheduler_holds_the_lease() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        let scheduler = fx.scheduler(5, &["unsynced"]);
        fx.leases
            .try_acquire("scheduler:file_sync", LeaseTtl::from_secs(60).unwrap())
            .unwrap()
            .unwrap();

        assert!(!scheduler.run_cycle().unwrap().is_obtained());
        assert_eq!(fx.state(1), ClaimState::Idle);
    }

    #[test]
    fn existing_claims_count_against_capacity() {
        let fx = fixture();
        fx.seed("unsynced", 1..=6);
        let scheduler = fx.scheduler(3, &["unsynced"]);

        let first = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(first.dispatched.len(), 3);
        assert_eq!(first.end, CycleEnd::CapacityReached);

        // Nothing finished; the next cycle has no room.
        let second = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(second.in_flight_at_start, 3);
        assert!(second.dispatched.is_empty());

        // One job finishes; exactly one slot opens.
        fx.backend.set_status(&first.dispatched[0].job_id, JobStatus::Completed);
        let third = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(third.dispatched_ids(), vec![ResourceId::new(4)]);
    }

    #[test]
    fn enqueue_failure_leaves_resource_idle_and_continues() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        fx.backend.reject_resource(ResourceId::new(1));

        let report = obtained(fx.scheduler(2, &["unsynced"]).run_cycle().unwrap());
        assert_eq!(report.failed_dispatches, vec![ResourceId::new(1)]);
        assert_eq!(
            report.dispatched_ids(),
            vec![ResourceId::new(2), ResourceId::new(3)]
        );
        assert_eq!(fx.state(1), ClaimState::Idle);
    }

    #[test]
    fn rejected_head_of_backlog_does_not_block_the_only_slot() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        fx.backend.reject_resource(ResourceId::new(1));

        let report = obtained(fx.scheduler(1, &["unsynced"]).run_cycle().unwrap());
        assert_eq!(report.dispatched_ids(), vec![ResourceId::new(2)]);
        assert_eq!(report.failed_dispatches, vec![ResourceId::new(1)]);
        assert_eq!(report.end, CycleEnd::CapacityReached);
        assert_eq!(fx.state(1), ClaimState::Idle);
        assert_eq!(fx.state(3), ClaimState::Idle);
    }

    #[test]
    fn all_candidates_rejected_ends_with_empty_backlog() {
        let fx = fixture();
        fx.seed("unsynced", 1..=2);
        fx.backend.reject_resource(ResourceId::new(1));
        fx.backend.reject_resource(ResourceId::new(2));

        let report = obtained(fx.scheduler(1, &["unsynced"]).run_cycle().unwrap());
        assert!(report.dispatched.is_empty());
        assert_eq!(
            report.failed_dispatches,
            vec![ResourceId::new(1), ResourceId::new(2)]
        );
        assert_eq!(report.end, CycleEnd::BacklogEmpty);
        assert_eq!(report.backlog_loads, 2);
    }

    #[test]
    fn scheduled_jobs_hold_the_dedup_marker() {
        let fx = fixture();
        fx.seed("unsynced", 1..=2);
        let (dedup, registry) = fx.dedup(DedupPolicy::RescheduleOnce);
        let scheduler = fx
            .scheduler(2, &["unsynced"])
            .with_dedup(dedup.clone(), &registry)
            .unwrap();

        let report = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(
            report.dispatched_ids(),
            vec![ResourceId::new(1), ResourceId::new(2)]
        );
        let first = &report.dispatched[0].job_id;
        assert!(fx.backend.envelope(first).unwrap().args.deduplicated);

        let registered = registry.resolve("geo.file_sync").unwrap();
        let duplicate = dedup
            .submit(registered, &JobArgs::for_resource(ResourceId::new(1)))
            .unwrap();
        assert_eq!(duplicate, SubmitOutcome::Deferred);
        assert_eq!(fx.backend.submitted().len(), 2);
    }

    #[test]
    fn outstanding_dedup_marker_passes_the_resource_over() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        let (dedup, registry) = fx.dedup(DedupPolicy::Drop);
        let ttl = LeaseTtl::from_secs(60).unwrap();
        assert!(dedup.store().try_mark(&dedup_key(&registry, 1), ttl).unwrap());
        let scheduler = fx
            .scheduler(2, &["unsynced"])
            .with_dedup(dedup, &registry)
            .unwrap();

        let report = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(report.deduplicated, vec![ResourceId::new(1)]);
        assert_eq!(
            report.dispatched_ids(),
            vec![ResourceId::new(2), ResourceId::new(3)]
        );
        assert!(report.failed_dispatches.is_empty());
        assert_eq!(fx.state(1), ClaimState::Idle);
    }

    #[test]
    fn failed_dispatch_releases_the_dedup_marker() {
        let fx = fixture();
        fx.seed("unsynced", 1..=2);
        fx.backend.reject_resource(ResourceId::new(1));
        let (dedup, registry) = fx.dedup(DedupPolicy::Drop);
        let scheduler = fx
            .scheduler(1, &["unsynced"])
            .with_dedup(dedup.clone(), &registry)
            .unwrap();

        let report = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(report.dispatched_ids(), vec![ResourceId::new(2)]);

        let ttl = LeaseTtl::from_secs(60).unwrap();
        assert!(dedup.store().try_mark(&dedup_key(&registry, 1), ttl).unwrap());
        assert!(!dedup.store().try_mark(&dedup_key(&registry, 2), ttl).unwrap());
    }

    #[test]
    fn backend_outage_stalls_cycle_without_claiming() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        fx.backend.set_available(false);

        let report = obtained(fx.scheduler(2, &["unsynced"]).run_cycle().unwrap());
        assert_eq!(report.end, CycleEnd::DispatchStalled);
        assert!(report.dispatched.is_empty());
        assert!((1..=3).all(|id| fx.state(id) == ClaimState::Idle));
    }

    #[test]
    fn vanished_jobs_free_capacity() {
        let fx = fixture();
        fx.seed("unsynced", 1..=4);
        let scheduler = fx.scheduler(2, &["unsynced"]);

        let first = obtained(scheduler.run_cycle().unwrap());
        for record in &first.dispatched {
            fx.backend.forget(&record.job_id);
        }

        // Forgotten jobs no longer count; the rest of the backlog is dispatched.
        let second = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(
            second.dispatched_ids(),
            vec![ResourceId::new(3), ResourceId::new(4)]
        );
    }

    #[test]
    fn zero_run_time_budget_dispatches_nothing() {
        let fx = fixture();
        fx.seed("unsynced", 1..=3);
        let mut scheduler = fx.scheduler(2, &["unsynced"]);
        scheduler.config.run_time = Duration::ZERO;

        let report = obtained(scheduler.run_cycle().unwrap());
        assert_eq!(report.end, CycleEnd::TimeBudgetExceeded);
        assert!(report.dispatched.is_empty());
    }
}
