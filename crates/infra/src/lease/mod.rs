//! Exclusive leases: short-lived distributed mutual exclusion with a TTL.
//!
//! ## Contract
//!
//! - `try_acquire` is an atomic test-and-set: it creates the lease only if no
//!   live lease exists for the key, and has no side effect when it fails.
//! - `release` removes the lease only for the current owner; releasing an
//!   expired or foreign lease is a no-op returning `false`.
//! - Acquisition never blocks or retries. Callers decide whether to skip or
//!   reschedule.
//! - Store unavailability is an error, never "acquired".
//!
//! [`ExclusiveLeaseGuard`] wraps an action with acquire / skip / release and
//! is shared by the scheduler and the job runner.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use syncwarden_core::LeaseToken;

pub use in_memory::InMemoryLeaseStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisLeaseStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid lease ttl: {0}")]
    InvalidTtl(String),
}

/// Lease time-to-live in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseTtl(u64);

impl LeaseTtl {
    pub fn from_secs(secs: u64) -> Result<Self, LeaseError> {
        if secs == 0 {
            return Err(LeaseError::InvalidTtl("ttl must be at least one second".into()));
        }
        Ok(Self(secs))
    }

    /// Sub-second remainders round up so a lease never lives shorter than asked.
    pub fn from_duration(duration: Duration) -> Result<Self, LeaseError> {
        let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
        Self::from_secs(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    pub(crate) fn as_chrono(&self) -> chrono::Duration {
        i64::try_from(self.0)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner_token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// Shared key/TTL store with atomic acquire-if-absent and release-if-owner.
pub trait LeaseStore: Send + Sync {
    /// Create the lease if none is live for `key`; `Ok(None)` when another
    /// holder has it.
    fn try_acquire(&self, key: &str, ttl: LeaseTtl) -> Result<Option<Lease>, LeaseError>;

    /// Remove the lease if `owner_token` still owns it. Returns whether a
    /// lease was removed.
    fn release(&self, key: &str, owner_token: &LeaseToken) -> Result<bool, LeaseError>;
}

impl<T: LeaseStore + ?Sized> LeaseStore for Arc<T> {
    fn try_acquire(&self, key: &str, ttl: LeaseTtl) -> Result<Option<Lease>, LeaseError> {
        (**self).try_acquire(key, ttl)
    }

    fn release(&self, key: &str, owner_token: &LeaseToken) -> Result<bool, LeaseError> {
        (**self).release(key, owner_token)
    }
}

/// Result of running an action under a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    /// The lease was obtained and the action ran.
    Obtained(T),
    /// Another holder owns the lease; the action was skipped.
    NotObtained,
}

impl<T> LeaseOutcome<T> {
    pub fn is_obtained(&self) -> bool {
        matches!(self, LeaseOutcome::Obtained(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            LeaseOutcome::Obtained(value) => Some(value),
            LeaseOutcome::NotObtained => None,
        }
    }
}

/// Runs actions under an exclusive lease.
#[derive(Debug, Clone)]
pub struct ExclusiveLeaseGuard<L> {
    store: L,
}

impl<L: LeaseStore> ExclusiveLeaseGuard<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Acquire `key`, run `action`, release.
    ///
    /// When the lease is held elsewhere the action is skipped (not queued, not
    /// retried). Once acquired, the lease is released on every exit path of
    /// the action, unwinding panics included.
    pub fn with_lease<T, F>(&self, key: &str, ttl: LeaseTtl, action: F) -> Result<LeaseOutcome<T>, LeaseError>
    where
        F: FnOnce(&Lease) -> T,
    {
        let Some(lease) = self.store.try_acquire(key, ttl)? else {
            debug!(lease_key = key, "lease held elsewhere, skipping");
            return Ok(LeaseOutcome::NotObtained);
        };

        let held = HeldLease {
            store: &self.store,
            lease,
        };
        let value = action(&held.lease);
        drop(held);

        Ok(LeaseOutcome::Obtained(value))
    }
}

/// Releases its lease when dropped.
struct HeldLease<'a, L: LeaseStore> {
    store: &'a L,
    lease: Lease,
}

impl<L: LeaseStore> Drop for HeldLease<'_, L> {
    fn drop(&mut self) {
        match self.store.release(&self.lease.key, &self.lease.owner_token) {
            Ok(true) => {}
            Ok(false) => {
                debug!(lease_key = %self.lease.key, "lease expired or taken over before release");
            }
            Err(err) => {
                warn!(lease_key = %self.lease.key, error = %err, "failed to release lease; it will expire");
            }
        }
    }
}
