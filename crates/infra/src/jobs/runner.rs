//! Executes one job envelope under the per-resource lease.

use std::sync::Arc;

use tracing::{debug, info, warn};

use syncwarden_core::{ClaimTransition, Clock, DataConsistency, JobId, Resource, ResourceId};

use crate::claims::ClaimStore;
use crate::error::DispatchError;
use crate::lease::{ExclusiveLeaseGuard, LeaseOutcome, LeaseStore, LeaseTtl};

use super::backend::JobQueue;
use super::dedup::{DedupStore, Deduplicator};
use super::registry::{HandlerRegistry, JobContext, RegisteredHandler};
use super::types::{JobEnvelope, JobOutcome, SkipReason};

/// Deduplicator shared between submitters and runners.
pub type SharedDeduplicator = Arc<Deduplicator<Arc<dyn JobQueue>, Arc<dyn DedupStore>>>;

/// Key of the lease serializing executions against one resource.
pub fn resource_lease_key(handler: &str, resource_id: ResourceId) -> String {
    format!("{handler}:resource:{resource_id}")
}

/// Runs jobs: resolves the handler, takes the per-resource lease, checks the
/// claim still belongs to this job, performs the action and records the
/// outcome on the claim.
pub struct JobRunner<C, L> {
    registry: Arc<HandlerRegistry>,
    claims: C,
    leases: ExclusiveLeaseGuard<L>,
    dedup: Option<SharedDeduplicator>,
    clock: Arc<dyn Clock>,
}

impl<C: ClaimStore, L: LeaseStore> JobRunner<C, L> {
    pub fn new(registry: Arc<HandlerRegistry>, claims: C, leases: L, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            claims,
            leases: ExclusiveLeaseGuard::new(leases),
            dedup: None,
            clock,
        }
    }

    /// Clear dedup markers after executions of deduplicated jobs and submit
    /// deferred follow-ups.
    pub fn with_dedup(mut self, dedup: SharedDeduplicator) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn run(&self, envelope: &JobEnvelope) -> Result<JobOutcome, DispatchError> {
        let registered = self.registry.resolve(envelope.handler.as_str())?;

        let outcome = match envelope.args.resource_id {
            Some(resource_id) => self.run_for_resource(registered, envelope, resource_id),
            None => self.run_unbound(registered, envelope),
        };

        // Only an execution that ran the action releases the dedup marker;
        // skipped or stray jobs leave it to the job that owns it.
        let executed = matches!(
            outcome,
            Ok(JobOutcome::Completed { .. }) | Err(DispatchError::DomainFailure { .. })
        );
        if let Some(dedup) = self.dedup.as_ref().filter(|_| executed && envelope.args.deduplicated) {
            match dedup.on_executed(registered, &envelope.args) {
                Ok(Some(follow_up)) => {
                    debug!(job_id = %envelope.job_id, follow_up = %follow_up, "follow-up enqueued");
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(job_id = %envelope.job_id, error = %err, "failed to clear dedup marker");
                }
            }
        }

        outcome
    }

    fn run_unbound(
        &self,
        registered: &RegisteredHandler,
        envelope: &JobEnvelope,
    ) -> Result<JobOutcome, DispatchError> {
        let ctx = JobContext {
            job_id: &envelope.job_id,
            handler: &registered.id,
            consistency: registered.config.data_consistency,
            resource: None,
        };

        registered
            .handler
            .perform(&ctx, &envelope.args)
            .map_err(|err| DispatchError::DomainFailure {
                handler: registered.id.to_string(),
                resource_id: None,
                reason: format!("{err:#}"),
            })?;

        Ok(JobOutcome::Completed {
            claim_updated: false,
        })
    }

    fn run_for_resource(
        &self,
        registered: &RegisteredHandler,
        envelope: &JobEnvelope,
        resource_id: ResourceId,
    ) -> Result<JobOutcome, DispatchError> {
        let key = resource_lease_key(registered.id.as_str(), resource_id);
        let ttl = LeaseTtl::from_duration(registered.config.lease_timeout)?;

        match self
            .leases
            .with_lease(&key, ttl, |_| self.perform_claimed(registered, envelope, resource_id))?
        {
            LeaseOutcome::Obtained(result) => result,
            LeaseOutcome::NotObtained => {
                debug!(
                    handler = %registered.id,
                    resource_id = %resource_id,
                    job_id = %envelope.job_id,
                    "resource busy, skipping job"
                );
                Ok(JobOutcome::Skipped(SkipReason::LeaseHeld))
            }
        }
    }

    /// Read the claim with the handler's consistency mode. A lagging replica
    /// may not show a claim written moments ago, so a delayed read that does
    /// not show this job's claim is repeated against the primary.
    fn read_claim(
        &self,
        resource_id: ResourceId,
        job_id: &JobId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, DispatchError> {
        let resource = self.claims.get(resource_id, consistency)?;
        if consistency == DataConsistency::Delayed
            && !resource.as_ref().is_some_and(|r| r.is_claimed_by(job_id))
        {
            debug!(resource_id = %resource_id, job_id = %job_id, "replica behind, reading primary");
            return Ok(self.claims.get(resource_id, DataConsistency::Strong)?);
        }
        Ok(resource)
    }

    fn perform_claimed(
        &self,
        registered: &RegisteredHandler,
        envelope: &JobEnvelope,
        resource_id: ResourceId,
    ) -> Result<JobOutcome, DispatchError> {
        let job_id = &envelope.job_id;
        let consistency = registered.config.data_consistency;

        let Some(resource) = self.read_claim(resource_id, job_id, consistency)? else {
            warn!(handler = %registered.id, resource_id = %resource_id, "resource no longer exists");
            return Ok(JobOutcome::Skipped(SkipReason::ResourceMissing));
        };

        if !resource.is_claimed_by(job_id) {
            info!(
                handler = %registered.id,
                resource_id = %resource_id,
                job_id = %job_id,
                claim_state = %resource.claim_state,
                "claim belongs to another dispatch, skipping"
            );
            return Ok(JobOutcome::Skipped(SkipReason::StaleClaim));
        }

        let ctx = JobContext {
            job_id,
            handler: &registered.id,
            consistency,
            resource: Some(&resource),
        };

        match registered.handler.perform(&ctx, &envelope.args) {
            Ok(()) => {
                if let Err(err) = self.claims.record_success_signal(resource_id, job_id, self.clock.now()) {
                    if !err.is_conflict() {
                        return Err(err.into());
                    }
                    warn!(
                        handler = %registered.id,
                        resource_id = %resource_id,
                        job_id = %job_id,
                        "claim changed before the success signal was recorded"
                    );
                }
                let claim_updated = self.record_transition(
                    resource_id,
                    &ClaimTransition::Complete {
                        job_id: job_id.clone(),
                    },
                )?;
                debug!(handler = %registered.id, resource_id = %resource_id, job_id = %job_id, "job completed");
                Ok(JobOutcome::Completed { claim_updated })
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let retry_at = registered
                    .config
                    .retry
                    .next_retry_at(resource.failure_count.saturating_add(1), self.clock.now());

                warn!(
                    handler = %registered.id,
                    resource_id = %resource_id,
                    job_id = %job_id,
                    reason = %reason,
                    retry_at = ?retry_at,
                    "job failed"
                );
                self.record_transition(
                    resource_id,
                    &ClaimTransition::Fail {
                        job_id: job_id.clone(),
                        reason: reason.clone(),
                        retry_at,
                    },
                )?;

                Err(DispatchError::DomainFailure {
                    handler: registered.id.to_string(),
                    resource_id: Some(resource_id),
                    reason,
                })
            }
        }
    }

    /// Apply a terminal transition. Losing the compare-and-set means the
    /// reconciler already repaired the claim; that is reported, not raised.
    fn record_transition(
        &self,
        resource_id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<bool, DispatchError> {
        match self.claims.transition(resource_id, transition) {
            Ok(_) => Ok(true),
            Err(err) if err.is_conflict() => {
                warn!(
                    resource_id = %resource_id,
                    transition = transition.name(),
                    error = %err,
                    "claim changed while the job ran"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<C, L> core::fmt::Debug for JobRunner<C, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("handlers", &self.registry.len())
            .field("dedup", &self.dedup.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use syncwarden_core::{
        BacklogSourceId, ClaimState, HandlerConfig, HandlerId, ManualClock, RetryPolicy,
    };

    use super::*;
    use crate::claims::InMemoryClaimStore;
    use crate::jobs::backend::InMemoryJobBackend;
    use crate::jobs::dedup::{DedupKey, InMemoryDedupStore, SubmitOutcome};
    use crate::jobs::registry::handler_fn;
    use crate::jobs::types::JobArgs;
    use crate::lease::InMemoryLeaseStore;

    struct Fixture {
        clock: ManualClock,
        claims: Arc<InMemoryClaimStore>,
        leases: Arc<InMemoryLeaseStore>,
        calls: Arc<AtomicUsize>,
    }

    fn handler_id() -> HandlerId {
        HandlerId::new("geo.repository_sync").unwrap()
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        Fixture {
            claims: Arc::new(InMemoryClaimStore::new(Arc::new(clock.clone()))),
            leases: Arc::new(InMemoryLeaseStore::new(Arc::new(clock.clone()))),
            calls: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    impl Fixture {
        fn runner(&self, fail: bool, config: HandlerConfig) -> JobRunner<Arc<InMemoryClaimStore>, Arc<InMemoryLeaseStore>> {
            let calls = self.calls.clone();
            let mut registry = HandlerRegistry::new();
            registry
                .register(
                    handler_id(),
                    handler_fn(move |ctx, _| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        assert!(ctx.resource.is_some());
                        if fail {
                            anyhow::bail!("remote fetch failed");
                        }
                        Ok(())
                    }),
                    config,
                )
                .unwrap();
            JobRunner::new(
                Arc::new(registry),
                self.claims.clone(),
                self.leases.clone(),
                Arc::new(self.clock.clone()),
            )
        }

        fn seed(&self, id: i64) {
            self.claims
                .insert(Resource::new(ResourceId::new(id), BacklogSourceId::new("unsynced").unwrap(), self.clock.now()))
                .unwrap();
        }

        fn claimed(&self, id: i64, job: &str) -> JobEnvelope {
            let resource_id = ResourceId::new(id);
            self.seed(id);
            let job_id = JobId::new(job).unwrap();
            self.claims
                .transition(
                    resource_id,
                    &ClaimTransition::Claim {
                        job_id: job_id.clone(),
                        handler: handler_id(),
                        dispatched_at: self.clock.now(),
                    },
                )
                .unwrap();
            JobEnvelope {
                job_id,
                handler: handler_id(),
                args: JobArgs::for_resource(resource_id),
                enqueued_at: Utc::now(),
            }
        }

        fn dedup(&self) -> (Arc<InMemoryJobBackend>, Arc<InMemoryDedupStore>, SharedDeduplicator) {
            let backend = Arc::new(InMemoryJobBackend::new(Arc::new(self.clock.clone())));
            let markers = Arc::new(InMemoryDedupStore::new(Arc::new(self.clock.clone())));
            let queue: Arc<dyn JobQueue> = backend.clone();
            let store: Arc<dyn DedupStore> = markers.clone();
            let dedup = Deduplicator::new(queue, store)
                .with_claims(self.claims.clone(), Arc::new(self.clock.clone()));
            (backend, markers, Arc::new(dedup))
        }

        fn state(&self, id: i64) -> Resource {
            self.claims
                .get(ResourceId::new(id), DataConsistency::Strong)
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn success_completes_claim_and_records_signal() {
        let fx = fixture();
        let envelope = fx.claimed(1, "abc123");

        let outcome = fx.runner(false, HandlerConfig::default()).run(&envelope).unwrap();
        assert_eq!(outcome, JobOutcome::Completed { claim_updated: true });

        let row = fx.state(1);
        assert_eq!(row.claim_state, ClaimState::Completed);
        assert!(row.success_signal_at.is_some());
        assert!(fx.leases.current("geo.repository_sync:resource:1").unwrap().is_none());
    }

    #[test]
    fn domain_failure_marks_claim_failed_with_reason_and_retry() {
        let fx = fixture();
        let envelope = fx.claimed(1, "abc123");
        let config = HandlerConfig {
            retry: RetryPolicy::fixed(3, std::time::Duration::from_secs(30)),
            ..HandlerConfig::default()
        };

        let err = fx.runner(true, config).run(&envelope).unwrap_err();
        assert!(matches!(err, DispatchError::DomainFailure { .. }));

        let row = fx.state(1);
        assert_eq!(row.claim_state, ClaimState::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("remote fetch failed"));
        assert_eq!(row.failure_count, 1);
        assert_eq!(
            row.retry_at,
            Some(fx.clock.now() + chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn stale_job_does_not_run() {
        let fx = fixture();
        let mut envelope = fx.claimed(1, "abc123");
        envelope.job_id = JobId::new("stray0").unwrap();

        let outcome = fx.runner(false, HandlerConfig::default()).run(&envelope).unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::StaleClaim));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.state(1).claim_state, ClaimState::Claimed);
    }

    #[test]
    fn held_resource_lease_skips_execution() {
        let fx = fixture();
        let envelope = fx.claimed(1, "abc123");
        let ttl = LeaseTtl::from_secs(60).unwrap();
        fx.leases
            .try_acquire("geo.repository_sync:resource:1", ttl)
            .unwrap()
            .unwrap();

        let outcome = fx.runner(false, HandlerConfig::default()).run(&envelope).unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::LeaseHeld));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delayed_consistency_falls_back_to_primary_for_fresh_claims() {
        let fx = fixture();
        let envelope = fx.claimed(1, "abc123");
        let config = HandlerConfig {
            data_consistency: DataConsistency::Delayed,
            ..HandlerConfig::default()
        };

        // The replica has never been synced and does not know the resource.
        let outcome = fx.runner(false, config).run(&envelope).unwrap();
        assert_eq!(outcome, JobOutcome::Completed { claim_updated: true });
    }

    #[test]
    fn unknown_handler_is_typed_error() {
        let fx = fixture();
        let mut envelope = fx.claimed(1, "abc123");
        envelope.handler = HandlerId::new("geo.unknown").unwrap();

        let err = fx.runner(false, HandlerConfig::default()).run(&envelope).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownHandler(name) if name == "geo.unknown"));
    }

    #[test]
    fn success_signal_of_a_superseded_job_is_not_recorded() {
        let fx = fixture();
        let envelope = fx.claimed(1, "j1");
        let claims = fx.claims.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                handler_id(),
                handler_fn(move |ctx, _| {
                    // The claim is repaired and dispatched again while this job runs.
                    let id = ResourceId::new(1);
                    claims.transition(
                        id,
                        &ClaimTransition::ResetOrphan {
                            job_id: ctx.job_id.clone(),
                            reason: "orphaned".into(),
                        },
                    )?;
                    claims.transition(
                        id,
                        &ClaimTransition::Claim {
                            job_id: JobId::new("j2")?,
                            handler: ctx.handler.clone(),
                            dispatched_at: Utc::now(),
                        },
                    )?;
                    Ok(())
                }),
                HandlerConfig::default(),
            )
            .unwrap();
        let runner = JobRunner::new(
            Arc::new(registry),
            fx.claims.clone(),
            fx.leases.clone(),
            Arc::new(fx.clock.clone()),
        );

        let outcome = runner.run(&envelope).unwrap();
        assert_eq!(outcome, JobOutcome::Completed { claim_updated: false });

        let row = fx.state(1);
        assert!(row.is_claimed_by(&JobId::new("j2").unwrap()));
        assert!(!row.has_success_signal());
        assert!(row.success_signal_job_id.is_none());
    }

    #[test]
    fn skipped_job_leaves_the_owners_dedup_marker() {
        let fx = fixture();
        fx.seed(1);
        let (backend, markers, dedup) = fx.dedup();
        let runner = fx.runner(false, HandlerConfig::default()).with_dedup(dedup.clone());
        let registered = runner.registry().resolve("geo.repository_sync").unwrap().clone();
        let args = JobArgs::for_resource(ResourceId::new(1));
        let key = DedupKey::derive(&registered.id, registered.handler.as_ref(), &args).unwrap();

        let SubmitOutcome::Enqueued(owner) = dedup.submit(&registered, &args).unwrap() else {
            panic!("first submission should be enqueued");
        };
        let owned = backend.envelope(&owner).unwrap();

        let stray = JobEnvelope {
            job_id: JobId::new("stray0").unwrap(),
            ..owned.clone()
        };
        assert_eq!(runner.run(&stray).unwrap(), JobOutcome::Skipped(SkipReason::StaleClaim));
        assert!(markers.is_outstanding(&key));

        assert_eq!(runner.run(&owned).unwrap(), JobOutcome::Completed { claim_updated: true });
        assert!(!markers.is_outstanding(&key));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_submitted_outside_the_deduplicator_does_not_clear_markers() {
        let fx = fixture();
        fx.seed(1);
        let (backend, markers, dedup) = fx.dedup();
        let runner = fx.runner(false, HandlerConfig::default()).with_dedup(dedup.clone());
        let registered = runner.registry().resolve("geo.repository_sync").unwrap().clone();
        let args = JobArgs::for_resource(ResourceId::new(1));
        let key = DedupKey::derive(&registered.id, registered.handler.as_ref(), &args).unwrap();

        let SubmitOutcome::Enqueued(owner) = dedup.submit(&registered, &args).unwrap() else {
            panic!("first submission should be enqueued");
        };
        let mut plain = backend.envelope(&owner).unwrap();
        plain.args.deduplicated = false;

        assert_eq!(runner.run(&plain).unwrap(), JobOutcome::Completed { claim_updated: true });
        assert!(markers.is_outstanding(&key));
    }
}
