//! Enqueue-then-claim, shared by the scheduler and the deduplicator.

use chrono::{DateTime, Utc};
use tracing::warn;

use syncwarden_core::{ClaimTransition, Clock, HandlerId, JobId};

use crate::claims::ClaimStore;
use crate::error::DispatchError;

use super::backend::JobQueue;
use super::types::JobArgs;

/// A submitted job and, for resource-bound jobs, the instant it was claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub job_id: JobId,
    pub dispatched_at: DateTime<Utc>,
}

/// Enqueue `args` and, when they name a resource, claim it for the new job.
///
/// The job id only exists once the backend accepted the job, so the claim
/// follows the enqueue. A lost claim race leaves a stray job that no-ops when
/// it runs because the claim names another job.
pub fn enqueue_and_claim<Q, C>(
    queue: &Q,
    claims: &C,
    clock: &dyn Clock,
    handler: &HandlerId,
    args: &JobArgs,
) -> Result<Dispatched, DispatchError>
where
    Q: JobQueue + ?Sized,
    C: ClaimStore + ?Sized,
{
    let job_id = queue.enqueue(handler, args)?;
    let dispatched_at = clock.now();

    if let Some(resource_id) = args.resource_id {
        let claim = ClaimTransition::Claim {
            job_id: job_id.clone(),
            handler: handler.clone(),
            dispatched_at,
        };
        if let Err(err) = claims.transition(resource_id, &claim) {
            warn!(
                handler = %handler,
                resource_id = %resource_id,
                job_id = %job_id,
                error = %err,
                "job enqueued but claim not taken; it will skip"
            );
            return Err(err.into());
        }
    }

    Ok(Dispatched {
        job_id,
        dispatched_at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use syncwarden_core::{
        BacklogSourceId, ClaimState, DataConsistency, ManualClock, Resource, ResourceId,
    };

    use super::*;
    use crate::claims::InMemoryClaimStore;
    use crate::jobs::backend::InMemoryJobBackend;

    fn handler() -> HandlerId {
        HandlerId::new("geo.file_sync").unwrap()
    }

    #[test]
    fn resource_bound_job_claims_the_resource() {
        let clock = ManualClock::default();
        let claims = InMemoryClaimStore::new(Arc::new(clock.clone()));
        let backend = InMemoryJobBackend::new(Arc::new(clock.clone()));
        let id = ResourceId::new(4);
        claims
            .insert(Resource::new(id, BacklogSourceId::new("unsynced").unwrap(), clock.now()))
            .unwrap();

        let dispatched =
            enqueue_and_claim(&backend, &claims, &clock, &handler(), &JobArgs::for_resource(id)).unwrap();

        let row = claims.get(id, DataConsistency::Strong).unwrap().unwrap();
        assert!(row.is_claimed_by(&dispatched.job_id));
        assert_eq!(row.dispatched_at, Some(dispatched.dispatched_at));
    }

    #[test]
    fn claimed_resource_refuses_a_second_dispatch() {
        let clock = ManualClock::default();
        let claims = InMemoryClaimStore::new(Arc::new(clock.clone()));
        let backend = InMemoryJobBackend::new(Arc::new(clock.clone()));
        let id = ResourceId::new(4);
        claims
            .insert(Resource::new(id, BacklogSourceId::new("unsynced").unwrap(), clock.now()))
            .unwrap();
        let args = JobArgs::for_resource(id);

        let first = enqueue_and_claim(&backend, &claims, &clock, &handler(), &args).unwrap();
        let err = enqueue_and_claim(&backend, &claims, &clock, &handler(), &args).unwrap_err();

        assert!(matches!(err, DispatchError::ClaimStore(ref e) if e.is_conflict()));
        let row = claims.get(id, DataConsistency::Strong).unwrap().unwrap();
        assert_eq!(row.claim_state, ClaimState::Claimed);
        assert!(row.is_claimed_by(&first.job_id));
    }

    #[test]
    fn unbound_job_is_only_enqueued() {
        let clock = ManualClock::default();
        let claims = InMemoryClaimStore::new(Arc::new(clock.clone()));
        let backend = InMemoryJobBackend::new(Arc::new(clock.clone()));

        let args = JobArgs::unbound(serde_json::json!({"project_id": 1}));
        let dispatched = enqueue_and_claim(&backend, &claims, &clock, &handler(), &args).unwrap();

        assert_eq!(backend.submitted(), vec![dispatched.job_id]);
        assert!(claims.is_empty());
    }
}
