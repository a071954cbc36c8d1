//! Redis-backed dedup markers.
//!
//! The marker is a plain key with a TTL; the follow-up request is a `1` value
//! stored in the marker itself so that check-and-set and finish are single
//! server-side scripts.

use std::sync::Arc;

use tracing::instrument;

use crate::lease::LeaseTtl;

use super::dedup::{DedupError, DedupKey, DedupStore, RescheduleRequest};

/// Returns -1 when no marker exists, 0 when a follow-up was already pending,
/// 1 when this call recorded it.
const RESCHEDULE_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
  return -1
elseif current == "1" then
  return 0
else
  redis.call("SET", KEYS[1], "1", "KEEPTTL")
  return 1
end
"#;

/// Deletes the marker and returns 1 if a follow-up was requested.
const FINISH_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
redis.call("DEL", KEYS[1])
if current == "1" then
  return 1
else
  return 0
end
"#;

const DEFAULT_NAMESPACE: &str = "syncwarden";

#[derive(Debug, Clone)]
pub struct RedisDedupStore {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisDedupStore {
    pub fn new(redis_url: impl AsRef<str>, namespace: Option<String>) -> Result<Self, DedupError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| DedupError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        })
    }

    fn namespaced(&self, key: &DedupKey) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn connection(&self) -> Result<redis::Connection, DedupError> {
        self.client
            .get_connection()
            .map_err(|e| DedupError::Unavailable(e.to_string()))
    }
}

impl DedupStore for RedisDedupStore {
    #[instrument(skip(self), fields(ttl_secs = ttl.as_secs()), err)]
    fn try_mark(&self, key: &DedupKey, ttl: LeaseTtl) -> Result<bool, DedupError> {
        let mut conn = self.connection()?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg("0")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query(&mut conn)
            .map_err(|e| DedupError::Unavailable(format!("SET NX failed: {e}")))?;
        Ok(set.is_some())
    }

    #[instrument(skip(self), err)]
    fn request_reschedule(&self, key: &DedupKey) -> Result<RescheduleRequest, DedupError> {
        let mut conn = self.connection()?;
        let result: i64 = redis::cmd("EVAL")
            .arg(RESCHEDULE_SCRIPT)
            .arg(1)
            .arg(self.namespaced(key))
            .query(&mut conn)
            .map_err(|e| DedupError::Unavailable(format!("reschedule script failed: {e}")))?;

        Ok(match result {
            1 => RescheduleRequest::Recorded,
            0 => RescheduleRequest::AlreadyPending,
            _ => RescheduleRequest::NotOutstanding,
        })
    }

    #[instrument(skip(self), err)]
    fn finish(&self, key: &DedupKey) -> Result<bool, DedupError> {
        let mut conn = self.connection()?;
        let requested: i64 = redis::cmd("EVAL")
            .arg(FINISH_SCRIPT)
            .arg(1)
            .arg(self.namespaced(key))
            .query(&mut conn)
            .map_err(|e| DedupError::Unavailable(format!("finish script failed: {e}")))?;
        Ok(requested == 1)
    }
}
