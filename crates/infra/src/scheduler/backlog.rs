//! Backlog sources and the interleaving/planning helpers of the scheduler.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use syncwarden_core::{BacklogSourceId, ClaimState, ResourceId};

use crate::claims::{ClaimQuery, ClaimStore, ClaimStoreError};

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("backlog source {source_id} unavailable: {message}")]
    Unavailable {
        source_id: BacklogSourceId,
        message: String,
    },
}

/// One origin of candidate resource ids.
pub trait BacklogSource: Send + Sync {
    fn id(&self) -> &BacklogSourceId;

    /// Up to `limit` candidate ids, none of them in `exclude`.
    fn load(
        &self,
        limit: usize,
        exclude: &BTreeSet<ResourceId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceId>, BacklogError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBacklogKind {
    /// Idle resources that were never processed or were reset.
    Idle,
    /// Failed resources whose retry time has come.
    RetryDue,
}

/// Backlog source reading from the claim store, filtered by origin.
#[derive(Debug, Clone)]
pub struct StoreBacklogSource<C> {
    source: BacklogSourceId,
    kind: StoreBacklogKind,
    claims: C,
}

impl<C: ClaimStore> StoreBacklogSource<C> {
    pub fn idle(source: BacklogSourceId, claims: C) -> Self {
        Self {
            source,
            kind: StoreBacklogKind::Idle,
            claims,
        }
    }

    pub fn retry_due(source: BacklogSourceId, claims: C) -> Self {
        Self {
            source,
            kind: StoreBacklogKind::RetryDue,
            claims,
        }
    }

    pub fn kind(&self) -> StoreBacklogKind {
        self.kind
    }

    fn query(&self, limit: usize, exclude: &BTreeSet<ResourceId>, now: DateTime<Utc>) -> ClaimQuery {
        let query = ClaimQuery::new(limit)
            .from_source(self.source.clone())
            .excluding(exclude.iter().copied());
        match self.kind {
            StoreBacklogKind::Idle => query.in_state(ClaimState::Idle),
            StoreBacklogKind::RetryDue => query.retry_due_at(now),
        }
    }

    fn unavailable(&self, err: ClaimStoreError) -> BacklogError {
        BacklogError::Unavailable {
            source_id: self.source.clone(),
            message: err.to_string(),
        }
    }
}

impl<C: ClaimStore> BacklogSource for StoreBacklogSource<C> {
    fn id(&self) -> &BacklogSourceId {
        &self.source
    }

    fn load(
        &self,
        limit: usize,
        exclude: &BTreeSet<ResourceId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceId>, BacklogError> {
        let rows = self
            .claims
            .find(&self.query(limit, exclude, now))
            .map_err(|e| self.unavailable(e))?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}

/// Round-robin merge: first of each list, then second of each, and so on.
/// Exhausted lists drop out; relative order within a list is kept.
pub fn interleave<T>(lists: Vec<Vec<T>>) -> Vec<T> {
    let total = lists.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut merged = Vec::with_capacity(total);

    while merged.len() < total {
        for it in iters.iter_mut() {
            if let Some(item) = it.next() {
                merged.push(item);
            }
        }
    }
    merged
}

/// How many of `pending` may be dispatched without exceeding `max_capacity`.
pub fn num_to_schedule(max_capacity: usize, in_flight: usize, pending: usize) -> usize {
    max_capacity.saturating_sub(in_flight).min(pending)
}
