//! Redis-backed lease store.
//!
//! - **Acquire**: `SET key token NX EX ttl`. Existence and expiry are
//!   evaluated server-side; client clocks are never compared.
//! - **Release**: an `EVAL` script deletes the key only if it still holds the
//!   caller's token.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use syncwarden_core::LeaseToken;

use super::{Lease, LeaseError, LeaseStore, LeaseTtl};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Default namespace prepended to every lease key.
const DEFAULT_NAMESPACE: &str = "syncwarden:lease";

#[derive(Debug, Clone)]
pub struct RedisLeaseStore {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisLeaseStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>, namespace: Option<String>) -> Result<Self, LeaseError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn connection(&self) -> Result<redis::Connection, LeaseError> {
        self.client
            .get_connection()
            .map_err(|e| LeaseError::Unavailable(e.to_string()))
    }
}

impl LeaseStore for RedisLeaseStore {
    #[instrument(skip(self), fields(ttl_secs = ttl.as_secs()), err)]
    fn try_acquire(&self, key: &str, ttl: LeaseTtl) -> Result<Option<Lease>, LeaseError> {
        let mut conn = self.connection()?;
        let token = LeaseToken::generate();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(token.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query(&mut conn)
            .map_err(|e| LeaseError::Unavailable(format!("SET NX failed: {e}")))?;

        Ok(acquired.map(|_| Lease {
            key: key.to_string(),
            owner_token: token,
            // Informational only; Redis owns the real expiry.
            expires_at: Utc::now() + ttl.as_chrono(),
        }))
    }

    #[instrument(skip(self, owner_token), err)]
    fn release(&self, key: &str, owner_token: &LeaseToken) -> Result<bool, LeaseError> {
        let mut conn = self.connection()?;

        let removed: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(self.namespaced(key))
            .arg(owner_token.to_string())
            .query(&mut conn)
            .map_err(|e| LeaseError::Unavailable(format!("release script failed: {e}")))?;

        Ok(removed == 1)
    }
}
