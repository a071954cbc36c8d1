//! Submission deduplication.
//!
//! A dedup key identifies "the same job": the handler id plus its normalized
//! arguments. While a job with a given key is outstanding (queued or
//! running), further submissions are either dropped or folded into a single
//! follow-up run that is enqueued once the outstanding one finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use syncwarden_core::{Clock, DedupPolicy, HandlerId, JobId};

use crate::claims::ClaimStore;
use crate::error::DispatchError;
use crate::lease::LeaseTtl;

use super::backend::JobQueue;
use super::dispatch::enqueue_and_claim;
use super::registry::{JobHandler, RegisteredHandler};
use super::types::JobArgs;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
    #[error("job arguments could not be canonicalized: {0}")]
    Canonicalize(String),
}

/// Stable identity of a logical job submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

impl DedupKey {
    /// `dedup:<handler>:<sha256(handler \0 canonical_json(args))>`
    pub fn derive(
        handler: &HandlerId,
        normalizer: &dyn JobHandler,
        args: &JobArgs,
    ) -> Result<Self, DedupError> {
        let normalized = serde_json::json!({
            "resource_id": args.resource_id,
            "payload": normalizer.normalize_payload(&args.payload),
        });
        let canonical =
            serde_jcs::to_string(&normalized).map_err(|e| DedupError::Canonicalize(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(handler.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());

        Ok(Self(format!(
            "dedup:{}:{}",
            handler,
            hex::encode(hasher.finalize())
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sort and deduplicate the array under `field` so that order-insensitive id
/// lists produce the same key. Other fields are left alone.
pub fn sorted_id_list(payload: &serde_json::Value, field: &str) -> serde_json::Value {
    let mut normalized = payload.clone();
    if let Some(serde_json::Value::Array(items)) = normalized.get_mut(field) {
        items.sort_by_key(|v| v.to_string());
        items.dedup();
    }
    normalized
}

/// Result of asking for a follow-up run of an outstanding key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleRequest {
    /// First duplicate: a follow-up will be enqueued on finish.
    Recorded,
    /// A follow-up was already pending; this duplicate is folded into it.
    AlreadyPending,
    /// The key is no longer outstanding; the caller should submit normally.
    NotOutstanding,
}

/// Short-lived markers keyed by [`DedupKey`].
pub trait DedupStore: Send + Sync {
    /// Mark `key` outstanding. Returns false if it already was.
    fn try_mark(&self, key: &DedupKey, ttl: LeaseTtl) -> Result<bool, DedupError>;

    /// Ask for one follow-up run once the outstanding job finishes.
    fn request_reschedule(&self, key: &DedupKey) -> Result<RescheduleRequest, DedupError>;

    /// Clear the marker. Returns whether a follow-up was requested.
    fn finish(&self, key: &DedupKey) -> Result<bool, DedupError>;
}

impl<T: DedupStore + ?Sized> DedupStore for Arc<T> {
    fn try_mark(&self, key: &DedupKey, ttl: LeaseTtl) -> Result<bool, DedupError> {
        (**self).try_mark(key, ttl)
    }

    fn request_reschedule(&self, key: &DedupKey) -> Result<RescheduleRequest, DedupError> {
        (**self).request_reschedule(key)
    }

    fn finish(&self, key: &DedupKey) -> Result<bool, DedupError> {
        (**self).finish(key)
    }
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    expires_at: DateTime<Utc>,
    reschedule: bool,
}

pub struct InMemoryDedupStore {
    markers: Mutex<HashMap<DedupKey, Marker>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDedupStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            markers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn markers(&self) -> Result<MutexGuard<'_, HashMap<DedupKey, Marker>>, DedupError> {
        self.markers
            .lock()
            .map_err(|_| DedupError::Unavailable("dedup store lock poisoned".into()))
    }

    fn live<'a>(
        markers: &'a mut HashMap<DedupKey, Marker>,
        key: &DedupKey,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Marker> {
        if markers.get(key).is_some_and(|m| m.expires_at <= now) {
            markers.remove(key);
        }
        markers.get_mut(key)
    }

    pub fn is_outstanding(&self, key: &DedupKey) -> bool {
        let now = self.clock.now();
        self.markers()
            .map(|mut m| Self::live(&mut m, key, now).is_some())
            .unwrap_or(false)
    }
}

impl core::fmt::Debug for InMemoryDedupStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryDedupStore").finish_non_exhaustive()
    }
}

impl DedupStore for InMemoryDedupStore {
    fn try_mark(&self, key: &DedupKey, ttl: LeaseTtl) -> Result<bool, DedupError> {
        let now = self.clock.now();
        let mut markers = self.markers()?;
        if Self::live(&mut markers, key, now).is_some() {
            return Ok(false);
        }
        markers.insert(
            key.clone(),
            Marker {
                expires_at: now + ttl.as_chrono(),
                reschedule: false,
            },
        );
        Ok(true)
    }

    fn request_reschedule(&self, key: &DedupKey) -> Result<RescheduleRequest, DedupError> {
        let now = self.clock.now();
        let mut markers = self.markers()?;
        Ok(match Self::live(&mut markers, key, now) {
            None => RescheduleRequest::NotOutstanding,
            Some(marker) if marker.reschedule => RescheduleRequest::AlreadyPending,
            Some(marker) => {
                marker.reschedule = true;
                RescheduleRequest::Recorded
            }
        })
    }

    fn finish(&self, key: &DedupKey) -> Result<bool, DedupError> {
        let mut markers = self.markers()?;
        Ok(markers.remove(key).is_some_and(|m| m.reschedule))
    }
}

/// Outcome of a deduplicated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome<T = JobId> {
    Enqueued(T),
    /// Discarded under the `drop` policy.
    Dropped,
    /// Folded into a follow-up run under the `reschedule_once` policy.
    Deferred,
}

/// Claim store used to bind resource-bound submissions to their resource.
#[derive(Clone)]
struct ClaimBinding {
    claims: Arc<dyn ClaimStore>,
    clock: Arc<dyn Clock>,
}

/// Submits jobs through a [`DedupStore`] according to each handler's policy.
///
/// Every job it enqueues carries the dedup flag, so the runner clears the
/// marker once that job's action ran. Resource-bound submissions are claimed
/// for the new job, which requires [`Deduplicator::with_claims`].
#[derive(Clone)]
pub struct Deduplicator<Q, D> {
    queue: Q,
    store: D,
    claims: Option<ClaimBinding>,
}

impl<Q, D> core::fmt::Debug for Deduplicator<Q, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("claims", &self.claims.is_some())
            .finish_non_exhaustive()
    }
}

impl<Q: JobQueue, D: DedupStore> Deduplicator<Q, D> {
    pub fn new(queue: Q, store: D) -> Self {
        Self {
            queue,
            store,
            claims: None,
        }
    }

    pub fn with_claims(mut self, claims: Arc<dyn ClaimStore>, clock: Arc<dyn Clock>) -> Self {
        self.claims = Some(ClaimBinding { claims, clock });
        self
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    /// Submit `args` unless an equal job is outstanding.
    pub fn submit(
        &self,
        registered: &RegisteredHandler,
        args: &JobArgs,
    ) -> Result<SubmitOutcome, DispatchError> {
        self.submit_with(registered, args, |args| self.dispatch(&registered.id, args))
    }

    /// Like [`Deduplicator::submit`], with the caller performing the
    /// submission once the marker is taken. The marker is released again if
    /// `dispatch` fails.
    pub fn submit_with<T, F>(
        &self,
        registered: &RegisteredHandler,
        args: &JobArgs,
        dispatch: F,
    ) -> Result<SubmitOutcome<T>, DispatchError>
    where
        F: FnOnce(&JobArgs) -> Result<T, DispatchError>,
    {
        let key = DedupKey::derive(&registered.id, registered.handler.as_ref(), args)?;
        let ttl = LeaseTtl::from_duration(registered.config.lease_timeout)?;

        if let Some(suppressed) = self.mark(registered, &key, ttl)? {
            return Ok(suppressed);
        }

        let owned = args.clone().mark_deduplicated();
        match dispatch(&owned) {
            Ok(submitted) => {
                debug!(handler = %registered.id, dedup_key = %key, "job submitted");
                Ok(SubmitOutcome::Enqueued(submitted))
            }
            Err(err) => {
                self.store.finish(&key)?;
                Err(err)
            }
        }
    }

    /// Take the marker for `key`. `None` means it was taken and the caller
    /// submits; otherwise the duplicate was dropped or deferred.
    fn mark<T>(
        &self,
        registered: &RegisteredHandler,
        key: &DedupKey,
        ttl: LeaseTtl,
    ) -> Result<Option<SubmitOutcome<T>>, DispatchError> {
        // A reschedule request can race with `finish`; retry the mark once
        // when the outstanding job disappeared in between.
        for _ in 0..2 {
            if self.store.try_mark(key, ttl)? {
                return Ok(None);
            }

            match registered.config.dedup_policy {
                DedupPolicy::Drop => {
                    debug!(handler = %registered.id, dedup_key = %key, "duplicate dropped");
                    return Ok(Some(SubmitOutcome::Dropped));
                }
                DedupPolicy::RescheduleOnce => match self.store.request_reschedule(key)? {
                    RescheduleRequest::Recorded | RescheduleRequest::AlreadyPending => {
                        debug!(handler = %registered.id, dedup_key = %key, "duplicate deferred");
                        return Ok(Some(SubmitOutcome::Deferred));
                    }
                    RescheduleRequest::NotOutstanding => continue,
                },
            }
        }

        Ok(Some(SubmitOutcome::Deferred))
    }

    fn dispatch(&self, handler: &HandlerId, args: &JobArgs) -> Result<JobId, DispatchError> {
        let Some(resource_id) = args.resource_id else {
            return Ok(self.queue.enqueue(handler, args)?);
        };
        let binding = self.claims.as_ref().ok_or_else(|| {
            DispatchError::Config(format!(
                "{handler}: job for resource {resource_id} submitted without a claim store"
            ))
        })?;

        enqueue_and_claim(
            &self.queue,
            binding.claims.as_ref(),
            binding.clock.as_ref(),
            handler,
            args,
        )
        .map(|dispatched| dispatched.job_id)
    }

    /// Clear the key after an execution finished; submit the follow-up if
    /// one was requested meanwhile.
    pub fn on_executed(
        &self,
        registered: &RegisteredHandler,
        args: &JobArgs,
    ) -> Result<Option<JobId>, DispatchError> {
        let key = DedupKey::derive(&registered.id, registered.handler.as_ref(), args)?;
        if !self.store.finish(&key)? {
            return Ok(None);
        }

        info!(handler = %registered.id, dedup_key = %key, "running deferred follow-up");
        match self.submit(registered, args)? {
            SubmitOutcome::Enqueued(job_id) => Ok(Some(job_id)),
            SubmitOutcome::Dropped | SubmitOutcome::Deferred => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use syncwarden_core::{
        BacklogSourceId, ClaimState, ClaimTransition, DataConsistency, HandlerConfig, ManualClock,
        Resource, ResourceId,
    };

    use super::*;
    use crate::claims::InMemoryClaimStore;
    use crate::jobs::backend::InMemoryJobBackend;
    use crate::jobs::registry::{JobContext, handler_fn};

    struct IdListHandler;

    impl JobHandler for IdListHandler {
        fn perform(&self, _: &JobContext<'_>, _: &JobArgs) -> anyhow::Result<()> {
            Ok(())
        }

        fn normalize_payload(&self, payload: &serde_json::Value) -> serde_json::Value {
            sorted_id_list(payload, "ids")
        }
    }

    fn registered(policy: DedupPolicy) -> RegisteredHandler {
        RegisteredHandler {
            id: HandlerId::new("geo.batch_verify").unwrap(),
            handler: Arc::new(handler_fn(|_, _| Ok(()))),
            config: HandlerConfig {
                dedup_policy: policy,
                ..HandlerConfig::default()
            },
        }
    }

    struct Fixture {
        clock: ManualClock,
        backend: Arc<InMemoryJobBackend>,
        claims: Arc<InMemoryClaimStore>,
        dedup: Deduplicator<Arc<InMemoryJobBackend>, InMemoryDedupStore>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let backend = Arc::new(InMemoryJobBackend::new(Arc::new(clock.clone())));
        let claims = Arc::new(InMemoryClaimStore::new(Arc::new(clock.clone())));
        claims
            .insert(Resource::new(
                ResourceId::new(1),
                BacklogSourceId::new("unsynced").unwrap(),
                clock.now(),
            ))
            .unwrap();
        let dedup = Deduplicator::new(backend.clone(), InMemoryDedupStore::new(Arc::new(clock.clone())))
            .with_claims(claims.clone(), Arc::new(clock.clone()));
        Fixture {
            clock,
            backend,
            claims,
            dedup,
        }
    }

    impl Fixture {
        /// Let the job that holds resource 1 finish.
        fn complete(&self, job_id: &JobId) {
            self.claims
                .transition(ResourceId::new(1), &ClaimTransition::Complete { job_id: job_id.clone() })
                .unwrap();
        }
    }

    fn args() -> JobArgs {
        JobArgs::for_resource(ResourceId::new(1))
    }

    #[test]
    fn key_ignores_object_key_order_and_includes_handler() {
        let handler = HandlerId::new("geo.sync").unwrap();
        let a = JobArgs::unbound(serde_json::json!({"a": 1, "b": 2}));
        let b = JobArgs::unbound(serde_json::json!({"b": 2, "a": 1}));
        let noop = handler_fn(|_, _| Ok(()));

        let ka = DedupKey::derive(&handler, &noop, &a).unwrap();
        assert_eq!(ka, DedupKey::derive(&handler, &noop, &b).unwrap());
        assert!(ka.as_str().starts_with("dedup:geo.sync:"));

        let other = HandlerId::new("geo.other").unwrap();
        assert_ne!(ka, DedupKey::derive(&other, &noop, &a).unwrap());
    }

    #[test]
    fn key_ignores_the_dedup_flag() {
        let handler = HandlerId::new("geo.sync").unwrap();
        let noop = handler_fn(|_, _| Ok(()));
        assert_eq!(
            DedupKey::derive(&handler, &noop, &args()).unwrap(),
            DedupKey::derive(&handler, &noop, &args().mark_deduplicated()).unwrap()
        );
    }

    #[test]
    fn normalizer_makes_id_order_irrelevant() {
        let handler = HandlerId::new("geo.batch_verify").unwrap();
        let a = JobArgs::unbound(serde_json::json!({"ids": [3, 1, 2]}));
        let b = JobArgs::unbound(serde_json::json!({"ids": [1, 2, 3, 3]}));

        assert_eq!(
            DedupKey::derive(&handler, &IdListHandler, &a).unwrap(),
            DedupKey::derive(&handler, &IdListHandler, &b).unwrap()
        );
    }

    #[test]
    fn resource_bound_submission_claims_the_resource() {
        let fx = fixture();
        let handler = registered(DedupPolicy::Drop);

        let SubmitOutcome::Enqueued(job_id) = fx.dedup.submit(&handler, &args()).unwrap() else {
            panic!("first submission should be enqueued");
        };

        let row = fx.claims.get(ResourceId::new(1), DataConsistency::Strong).unwrap().unwrap();
        assert!(row.is_claimed_by(&job_id));
        assert!(fx.backend.envelope(&job_id).unwrap().args.deduplicated);
    }

    #[test]
    fn resource_bound_submission_without_claim_store_is_refused() {
        let clock = ManualClock::default();
        let backend = Arc::new(InMemoryJobBackend::new(Arc::new(clock.clone())));
        let dedup = Deduplicator::new(backend.clone(), InMemoryDedupStore::new(Arc::new(clock.clone())));
        let handler = registered(DedupPolicy::Drop);

        assert!(matches!(dedup.submit(&handler, &args()), Err(DispatchError::Config(_))));
        assert!(backend.submitted().is_empty());

        let key = DedupKey::derive(&handler.id, handler.handler.as_ref(), &args()).unwrap();
        assert!(!dedup.store().is_outstanding(&key));
    }

    #[test]
    fn drop_policy_discards_duplicates() {
        let fx = fixture();
        let handler = registered(DedupPolicy::Drop);

        let SubmitOutcome::Enqueued(first) = fx.dedup.submit(&handler, &args()).unwrap() else {
            panic!("first submission should be enqueued");
        };
        assert_eq!(fx.dedup.submit(&handler, &args()).unwrap(), SubmitOutcome::Dropped);

        fx.complete(&first);
        assert_eq!(fx.dedup.on_executed(&handler, &args()).unwrap(), None);
        assert!(matches!(fx.dedup.submit(&handler, &args()).unwrap(), SubmitOutcome::Enqueued(_)));
    }

    #[test]
    fn reschedule_once_coalesces_many_duplicates_into_one_claimed_follow_up() {
        let fx = fixture();
        let handler = registered(DedupPolicy::RescheduleOnce);

        let SubmitOutcome::Enqueued(first) = fx.dedup.submit(&handler, &args()).unwrap() else {
            panic!("first submission should be enqueued");
        };
        for _ in 0..5 {
            assert_eq!(fx.dedup.submit(&handler, &args()).unwrap(), SubmitOutcome::Deferred);
        }

        fx.complete(&first);
        let follow_up = fx.dedup.on_executed(&handler, &args()).unwrap().unwrap();
        let row = fx.claims.get(ResourceId::new(1), DataConsistency::Strong).unwrap().unwrap();
        assert_eq!(row.claim_state, ClaimState::Claimed);
        assert!(row.is_claimed_by(&follow_up));

        fx.complete(&follow_up);
        assert_eq!(fx.dedup.on_executed(&handler, &args()).unwrap(), None);
        assert_eq!(fx.backend.submitted().len(), 2);
    }

    #[test]
    fn submit_with_hands_the_flagged_args_to_the_caller() {
        let fx = fixture();
        let handler = registered(DedupPolicy::Drop);

        let outcome = fx
            .dedup
            .submit_with(&handler, &args(), |args| Ok(args.deduplicated))
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Enqueued(true));
        assert_eq!(
            fx.dedup.submit_with(&handler, &args(), |_| Ok(())).unwrap(),
            SubmitOutcome::Dropped
        );
    }

    #[test]
    fn markers_expire_after_ttl() {
        let fx = fixture();
        let handler = registered(DedupPolicy::Drop);
        let payload = JobArgs::unbound(serde_json::json!({"ids": [1, 2]}));

        fx.dedup.submit(&handler, &payload).unwrap();
        fx.clock.advance(handler.config.lease_timeout);
        assert!(matches!(fx.dedup.submit(&handler, &payload).unwrap(), SubmitOutcome::Enqueued(_)));
    }

    #[test]
    fn failed_enqueue_releases_marker() {
        let fx = fixture();
        let handler = registered(DedupPolicy::Drop);

        fx.backend.set_available(false);
        assert!(fx.dedup.submit(&handler, &args()).is_err());
        assert_eq!(
            fx.claims.get(ResourceId::new(1), DataConsistency::Strong).unwrap().unwrap().claim_state,
            ClaimState::Idle
        );

        fx.backend.set_available(true);
        assert!(matches!(fx.dedup.submit(&handler, &args()).unwrap(), SubmitOutcome::Enqueued(_)));
    }
}
