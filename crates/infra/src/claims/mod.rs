//! Persisted resource claims.
//!
//! The claim store is the only shared mutable state between the scheduler,
//! job runners and the reconciler. Every mutation goes through
//! [`ClaimStore::transition`], a compare-and-set on the claim's current state
//! and job id, so two components racing on one resource can never both win.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use syncwarden_core::{
    BacklogSourceId, ClaimState, ClaimTransition, CoreError, DataConsistency, HandlerId, JobId,
    Resource, ResourceId,
};

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryClaimStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresClaimStore;

#[derive(Debug, thiserror::Error)]
pub enum ClaimStoreError {
    #[error("claim store unavailable: {0}")]
    Unavailable(String),

    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    /// The compare-and-set precondition did not hold.
    #[error("claim conflict: {0}")]
    Conflict(#[from] CoreError),

    #[error("claim row could not be decoded: {0}")]
    Serialization(String),
}

impl ClaimStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ClaimStoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClaimStoreError::Conflict(_))
    }
}

/// Filter for batched claim lookups. Results are ordered by resource id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimQuery {
    pub state: Option<ClaimState>,
    pub backlog_source: Option<BacklogSourceId>,
    pub claimed_by: Option<HandlerId>,
    /// Only claims dispatched strictly before this instant.
    pub dispatched_before: Option<DateTime<Utc>>,
    /// Only failed claims whose `retry_at` is at or before this instant.
    pub retry_due_at: Option<DateTime<Utc>>,
    pub exclude: BTreeSet<ResourceId>,
    pub limit: usize,
}

impl ClaimQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn in_state(mut self, state: ClaimState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn from_source(mut self, source: BacklogSourceId) -> Self {
        self.backlog_source = Some(source);
        self
    }

    pub fn claimed_by(mut self, handler: HandlerId) -> Self {
        self.claimed_by = Some(handler);
        self
    }

    pub fn dispatched_before(mut self, at: DateTime<Utc>) -> Self {
        self.dispatched_before = Some(at);
        self
    }

    pub fn retry_due_at(mut self, now: DateTime<Utc>) -> Self {
        self.retry_due_at = Some(now);
        self
    }

    pub fn excluding<I: IntoIterator<Item = ResourceId>>(mut self, ids: I) -> Self {
        self.exclude.extend(ids);
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if self.exclude.contains(&resource.id) {
            return false;
        }
        if self.state.is_some_and(|s| s != resource.claim_state) {
            return false;
        }
        if self
            .backlog_source
            .as_ref()
            .is_some_and(|s| *s != resource.backlog_source)
        {
            return false;
        }
        if self
            .claimed_by
            .as_ref()
            .is_some_and(|h| resource.claimed_by.as_ref() != Some(h))
        {
            return false;
        }
        if let Some(before) = self.dispatched_before {
            if !resource.dispatched_at.is_some_and(|at| at < before) {
                return false;
            }
        }
        if let Some(now) = self.retry_due_at {
            if !resource.is_retry_due(now) {
                return false;
            }
        }
        true
    }
}

/// Relational store of resource claims.
pub trait ClaimStore: Send + Sync {
    /// Read one claim. `Delayed` reads may observe a lagging replica.
    fn get(
        &self,
        id: ResourceId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, ClaimStoreError>;

    /// Create or overwrite a resource row (resources are created externally).
    fn insert(&self, resource: Resource) -> Result<(), ClaimStoreError>;

    /// Atomically check and apply `transition`, returning the updated row.
    fn transition(
        &self,
        id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<Resource, ClaimStoreError>;

    /// Record that `job_id`'s domain action succeeded, independently of the
    /// claim transition. A `Conflict` if the claim no longer names `job_id`.
    fn record_success_signal(
        &self,
        id: ResourceId,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimStoreError>;

    /// Batched lookup, always against the primary.
    fn find(&self, query: &ClaimQuery) -> Result<Vec<Resource>, ClaimStoreError>;

    /// Operator retry: move a failed claim back to idle.
    fn reset_failed(&self, id: ResourceId) -> Result<Resource, ClaimStoreError> {
        self.transition(id, &ClaimTransition::ManualReset)
    }
}

impl<T: ClaimStore + ?Sized> ClaimStore for std::sync::Arc<T> {
    fn get(
        &self,
        id: ResourceId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, ClaimStoreError> {
        (**self).get(id, consistency)
    }

    fn insert(&self, resource: Resource) -> Result<(), ClaimStoreError> {
        (**self).insert(resource)
    }

    fn transition(
        &self,
        id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<Resource, ClaimStoreError> {
        (**self).transition(id, transition)
    }

    fn record_success_signal(
        &self,
        id: ResourceId,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimStoreError> {
        (**self).record_success_signal(id, job_id, at)
    }

    fn find(&self, query: &ClaimQuery) -> Result<Vec<Resource>, ClaimStoreError> {
        (**self).find(query)
    }

    fn reset_failed(&self, id: ResourceId) -> Result<Resource, ClaimStoreError> {
        (**self).reset_failed(id)
    }
}
