//! In-process lease store for tests and single-node deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use syncwarden_core::{Clock, LeaseToken};

use super::{Lease, LeaseError, LeaseStore, LeaseTtl};

/// Lease store backed by a `RwLock<HashMap>`.
///
/// Expiry is evaluated inside the write lock against a single clock read, so
/// test-and-set is atomic with respect to every other caller in the process.
pub struct InMemoryLeaseStore {
    leases: RwLock<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// The live lease for `key`, if any.
    pub fn current(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        let leases = self.leases.read().map_err(poisoned)?;
        let now = self.clock.now();
        Ok(leases.get(key).filter(|l| l.expires_at > now).cloned())
    }
}

impl core::fmt::Debug for InMemoryLeaseStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryLeaseStore").finish_non_exhaustive()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> LeaseError {
    LeaseError::Unavailable("lease table lock poisoned".into())
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(&self, key: &str, ttl: LeaseTtl) -> Result<Option<Lease>, LeaseError> {
        let mut leases = self.leases.write().map_err(poisoned)?;
        let now = self.clock.now();

        if leases.get(key).is_some_and(|existing| existing.expires_at > now) {
            return Ok(None);
        }

        let lease = Lease {
            key: key.to_string(),
            owner_token: LeaseToken::generate(),
            expires_at: now + ttl.as_chrono(),
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    fn release(&self, key: &str, owner_token: &LeaseToken) -> Result<bool, LeaseError> {
        let mut leases = self.leases.write().map_err(poisoned)?;
        let now = self.clock.now();

        match leases.get(key) {
            Some(lease) if lease.owner_token == *owner_token && lease.expires_at > now => {
                leases.remove(key);
                Ok(true)
            }
            Some(lease) if lease.expires_at <= now => {
                // Expired leases are garbage regardless of owner.
                leases.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
