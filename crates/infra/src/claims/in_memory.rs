use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::debug;

use syncwarden_core::{ClaimTransition, Clock, DataConsistency, JobId, Resource, ResourceId};

use super::{ClaimQuery, ClaimStore, ClaimStoreError};

/// In-memory claim store with a primary map and a lagging replica snapshot.
///
/// Strong reads hit the primary; delayed reads hit the replica, which only
/// catches up when [`InMemoryClaimStore::sync_replica`] is called.
pub struct InMemoryClaimStore {
    primary: RwLock<BTreeMap<ResourceId, Resource>>,
    replica: RwLock<BTreeMap<ResourceId, Resource>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryClaimStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            primary: RwLock::new(BTreeMap::new()),
            replica: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Copy the primary into the replica.
    pub fn sync_replica(&self) -> Result<(), ClaimStoreError> {
        let snapshot = self.read_primary()?.clone();
        *self.write_replica()? = snapshot;
        Ok(())
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.read_primary().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), ClaimStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClaimStoreError::Unavailable("claim store marked unavailable".into()))
        }
    }

    fn read_primary(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ResourceId, Resource>>, ClaimStoreError> {
        self.primary
            .read()
            .map_err(|_| ClaimStoreError::Unavailable("claim store lock poisoned".into()))
    }

    fn write_primary(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<ResourceId, Resource>>, ClaimStoreError> {
        self.primary
            .write()
            .map_err(|_| ClaimStoreError::Unavailable("claim store lock poisoned".into()))
    }

    fn read_replica(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ResourceId, Resource>>, ClaimStoreError> {
        self.replica
            .read()
            .map_err(|_| ClaimStoreError::Unavailable("replica lock poisoned".into()))
    }

    fn write_replica(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<ResourceId, Resource>>, ClaimStoreError> {
        self.replica
            .write()
            .map_err(|_| ClaimStoreError::Unavailable("replica lock poisoned".into()))
    }
}

impl core::fmt::Debug for InMemoryClaimStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryClaimStore")
            .field("resources", &self.len())
            .finish_non_exhaustive()
    }
}

impl ClaimStore for InMemoryClaimStore {
    fn get(
        &self,
        id: ResourceId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, ClaimStoreError> {
        self.ensure_available()?;
        let map = match consistency {
            DataConsistency::Strong => self.read_primary()?,
            DataConsistency::Delayed => self.read_replica()?,
        };
        Ok(map.get(&id).cloned())
    }

    fn insert(&self, resource: Resource) -> Result<(), ClaimStoreError> {
        self.ensure_available()?;
        self.write_primary()?.insert(resource.id, resource);
        Ok(())
    }

    fn transition(
        &self,
        id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<Resource, ClaimStoreError> {
        self.ensure_available()?;
        let mut map = self.write_primary()?;
        let resource = map.get_mut(&id).ok_or(ClaimStoreError::NotFound(id))?;

        transition.apply(resource, self.clock.now())?;
        debug!(
            resource_id = %id,
            transition = transition.name(),
            state = %resource.claim_state,
            "claim transitioned"
        );
        Ok(resource.clone())
    }

    fn record_success_signal(
        &self,
        id: ResourceId,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimStoreError> {
        self.ensure_available()?;
        let mut map = self.write_primary()?;
        let resource = map.get_mut(&id).ok_or(ClaimStoreError::NotFound(id))?;
        resource.record_success_signal(job_id, at)?;
        resource.updated_at = self.clock.now();
        Ok(())
    }

    fn find(&self, query: &ClaimQuery) -> Result<Vec<Resource>, ClaimStoreError> {
        self.ensure_available()?;
        let map = self.read_primary()?;
        Ok(map
            .values()
            .filter(|r| query.matches(r))
            .take(query.limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use syncwarden_core::{BacklogSourceId, ClaimState, HandlerId, ManualClock};

    use super::*;

    fn store() -> InMemoryClaimStore {
        InMemoryClaimStore::new(Arc::new(ManualClock::default()))
    }

    fn seed(store: &InMemoryClaimStore, id: i64) {
        store
            .insert(Resource::new(
                ResourceId::new(id),
                BacklogSourceId::new("unsynced").unwrap(),
                Utc::now(),
            ))
            .unwrap();
    }

    fn claim(job: &str) -> ClaimTransition {
        ClaimTransition::Claim {
            job_id: JobId::new(job).unwrap(),
            handler: HandlerId::new("geo.file_sync").unwrap(),
            dispatched_at: Utc::now(),
        }
    }

    #[test]
    fn delayed_reads_lag_until_replica_sync() {
        let store = store();
        seed(&store, 1);
        let id = ResourceId::new(1);

        assert!(store.get(id, DataConsistency::Delayed).unwrap().is_none());
        assert!(store.get(id, DataConsistency::Strong).unwrap().is_some());

        store.sync_replica().unwrap();
        store.transition(id, &claim("j1")).unwrap();

        let replica = store.get(id, DataConsistency::Delayed).unwrap().unwrap();
        assert_eq!(replica.claim_state, ClaimState::Idle);
        let primary = store.get(id, DataConsistency::Strong).unwrap().unwrap();
        assert_eq!(primary.claim_state, ClaimState::Claimed);
    }

    #[test]
    fn transition_on_missing_resource_is_not_found() {
        let err = store().transition(ResourceId::new(9), &claim("j1")).unwrap_err();
        assert!(matches!(err, ClaimStoreError::NotFound(id) if id == ResourceId::new(9)));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let store = Arc::new(store());
        seed(&store, 1);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .transition(ResourceId::new(1), &claim(&format!("job{i}")))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn failed_conflicting_transition_leaves_row_untouched() {
        let store = store();
        seed(&store, 1);
        let id = ResourceId::new(1);
        store.transition(id, &claim("j1")).unwrap();

        let err = store
            .transition(id, &ClaimTransition::Complete { job_id: JobId::new("j2").unwrap() })
            .unwrap_err();
        assert!(err.is_conflict());

        let row = store.get(id, DataConsistency::Strong).unwrap().unwrap();
        assert!(row.is_claimed_by(&JobId::new("j1").unwrap()));
    }

    #[test]
    fn success_signal_is_refused_for_a_job_that_lost_the_claim() {
        let store = store();
        seed(&store, 1);
        let id = ResourceId::new(1);
        let j1 = JobId::new("j1").unwrap();
        store.transition(id, &claim("j1")).unwrap();
        store
            .transition(id, &ClaimTransition::ResetOrphan { job_id: j1.clone(), reason: "lost".into() })
            .unwrap();
        store.transition(id, &claim("j2")).unwrap();

        let err = store.record_success_signal(id, &j1, Utc::now()).unwrap_err();
        assert!(err.is_conflict());
        assert!(!store.get(id, DataConsistency::Strong).unwrap().unwrap().has_success_signal());

        store
            .record_success_signal(id, &JobId::new("j2").unwrap(), Utc::now())
            .unwrap();
        assert!(store.get(id, DataConsistency::Strong).unwrap().unwrap().has_success_signal());
    }

    #[test]
    fn reset_failed_returns_claim_to_idle() {
        let store = store();
        seed(&store, 1);
        let id = ResourceId::new(1);
        store.transition(id, &claim("j1")).unwrap();
        store
            .transition(
                id,
                &ClaimTransition::Fail {
                    job_id: JobId::new("j1").unwrap(),
                    reason: "boom".into(),
                    retry_at: None,
                },
            )
            .unwrap();

        let row = store.reset_failed(id).unwrap();
        assert_eq!(row.claim_state, ClaimState::Idle);
        assert_eq!(row.failure_count, 0);
        assert!(store.reset_failed(id).is_err());
    }

    #[test]
    fn find_respects_limit_and_order() {
        let store = store();
        for id in [5, 3, 1, 4, 2] {
            seed(&store, id);
        }

        let ids: Vec<_> = store
            .find(&ClaimQuery::new(3).in_state(ClaimState::Idle))
            .unwrap()
            .into_iter()
            .map(|r| r.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn outage_surfaces_as_unavailable() {
        let store = store();
        store.set_available(false);
        let err = store.find(&ClaimQuery::new(1)).unwrap_err();
        assert!(err.is_unavailable());
    }
}
