//! Postgres-backed claim store.
//!
//! Claims live in a single `resource_claims` table. Transitions run inside a
//! transaction that locks the row (`SELECT … FOR UPDATE`), checks and applies
//! the transition in Rust, and writes the row back, so the compare-and-set
//! holds across processes.
//!
//! Delayed-consistency reads go to the replica pool when one is configured;
//! everything else goes to the primary.
//!
//! ## Error Mapping
//!
//! | SQLx Error | ClaimStoreError |
//! |------------|-----------------|
//! | PoolClosed, PoolTimedOut, Io, Tls | `Unavailable` |
//! | ColumnDecode, Decode, ColumnNotFound | `Serialization` |
//! | anything else | `Unavailable` |

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use syncwarden_core::{
    BacklogSourceId, ClaimState, ClaimTransition, Clock, DataConsistency, HandlerId, JobId,
    Resource, ResourceId,
};

use super::{ClaimQuery, ClaimStore, ClaimStoreError};

/// DDL for the claims table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resource_claims (
    resource_id         BIGINT PRIMARY KEY,
    backlog_source      TEXT NOT NULL,
    claim_state         TEXT NOT NULL DEFAULT 'idle',
    last_claimed_job_id TEXT,
    claimed_by          TEXT,
    dispatched_at       TIMESTAMPTZ,
    success_signal_at   TIMESTAMPTZ,
    success_signal_job_id TEXT,
    failure_reason      TEXT,
    failure_count       INTEGER NOT NULL DEFAULT 0,
    retry_at            TIMESTAMPTZ,
    updated_at          TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS resource_claims_state_dispatched
    ON resource_claims (claim_state, dispatched_at);
"#;

const COLUMNS: &str = "resource_id, backlog_source, claim_state, last_claimed_job_id, claimed_by, \
     dispatched_at, success_signal_at, success_signal_job_id, failure_reason, failure_count, \
     retry_at, updated_at";

#[derive(Clone)]
pub struct PostgresClaimStore {
    primary: Arc<PgPool>,
    replica: Option<Arc<PgPool>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for PostgresClaimStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresClaimStore")
            .field("has_replica", &self.replica.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresClaimStore {
    pub fn new(primary: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            primary: Arc::new(primary),
            replica: None,
            clock,
        }
    }

    /// Serve delayed-consistency reads from `replica`.
    pub fn with_replica(mut self, replica: PgPool) -> Self {
        self.replica = Some(Arc::new(replica));
        self
    }

    /// Create the claims table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), ClaimStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.primary)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn pool_for(&self, consistency: DataConsistency) -> &PgPool {
        match (consistency, &self.replica) {
            (DataConsistency::Delayed, Some(replica)) => replica,
            _ => &self.primary,
        }
    }

    #[instrument(skip(self), fields(resource_id = %id), err)]
    pub async fn fetch(
        &self,
        id: ResourceId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, ClaimStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM resource_claims WHERE resource_id = $1"
        ))
        .bind(id.get())
        .fetch_optional(self.pool_for(consistency))
        .await
        .map_err(|e| map_sqlx_error("fetch_claim", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn upsert(&self, resource: &Resource) -> Result<(), ClaimStoreError> {
        write_row(&*self.primary, resource, true).await
    }

    #[instrument(skip(self, transition), fields(resource_id = %id, transition = transition.name()), err)]
    pub async fn apply_transition(
        &self,
        id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<Resource, ClaimStoreError> {
        let mut tx = self
            .primary
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM resource_claims WHERE resource_id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_claim", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(ClaimStoreError::NotFound(id));
        };

        let mut resource = decode_row(&row)?;
        if let Err(err) = transition.apply(&mut resource, self.clock.now()) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(ClaimStoreError::Conflict(err));
        }

        write_row(&mut *tx, &resource, false).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(resource)
    }

    /// Conditional on the row still being claimed by `job_id`.
    pub async fn store_success_signal(
        &self,
        id: ResourceId,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimStoreError> {
        let result = sqlx::query(
            "UPDATE resource_claims \
             SET success_signal_at = $3, success_signal_job_id = $2, updated_at = $4 \
             WHERE resource_id = $1 AND claim_state = 'claimed' AND last_claimed_job_id = $2",
        )
        .bind(id.get())
        .bind(job_id.as_str())
        .bind(at)
        .bind(self.clock.now())
        .execute(&*self.primary)
        .await
        .map_err(|e| map_sqlx_error("record_success_signal", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Nothing matched: either the row is gone or another job holds it.
        match self.fetch(id, DataConsistency::Strong).await? {
            None => Err(ClaimStoreError::NotFound(id)),
            Some(mut current) => Err(ClaimStoreError::Conflict(
                current.record_success_signal(job_id, at).err().unwrap_or_else(|| {
                    syncwarden_core::CoreError::invalid_transition(format!(
                        "claim of resource {id} changed while recording the success signal"
                    ))
                }),
            )),
        }
    }

    pub async fn query(&self, query: &ClaimQuery) -> Result<Vec<Resource>, ClaimStoreError> {
        let exclude: Vec<i64> = query.exclude.iter().map(ResourceId::get).collect();
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM resource_claims
            WHERE ($1::text IS NULL OR claim_state = $1)
              AND ($2::text IS NULL OR backlog_source = $2)
              AND ($3::text IS NULL OR claimed_by = $3)
              AND ($4::timestamptz IS NULL OR dispatched_at < $4)
              AND ($5::timestamptz IS NULL
                   OR (claim_state = 'failed' AND retry_at IS NOT NULL AND retry_at <= $5))
              AND NOT (resource_id = ANY($6))
            ORDER BY resource_id
            LIMIT $7
            "#
        ))
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.backlog_source.as_ref().map(BacklogSourceId::as_str))
        .bind(query.claimed_by.as_ref().map(HandlerId::as_str))
        .bind(query.dispatched_before)
        .bind(query.retry_due_at)
        .bind(&exclude[..])
        .bind(limit)
        .fetch_all(&*self.primary)
        .await
        .map_err(|e| map_sqlx_error("find_claims", e))?;

        rows.iter().map(decode_row).collect()
    }

    fn block_on<T, F>(&self, fut: F) -> Result<T, ClaimStoreError>
    where
        F: Future<Output = Result<T, ClaimStoreError>>,
    {
        // The ClaimStore trait is synchronous; run the query on the ambient
        // tokio runtime.
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ClaimStoreError::Unavailable(
                "PostgresClaimStore requires a tokio runtime context".to_string(),
            )
        })?;
        handle.block_on(fut)
    }
}

async fn write_row<'e, E>(executor: E, r: &Resource, upsert: bool) -> Result<(), ClaimStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let conflict = if upsert {
        "ON CONFLICT (resource_id) DO UPDATE SET \
         backlog_source = EXCLUDED.backlog_source, claim_state = EXCLUDED.claim_state, \
         last_claimed_job_id = EXCLUDED.last_claimed_job_id, claimed_by = EXCLUDED.claimed_by, \
         dispatched_at = EXCLUDED.dispatched_at, success_signal_at = EXCLUDED.success_signal_at, \
         success_signal_job_id = EXCLUDED.success_signal_job_id, \
         failure_reason = EXCLUDED.failure_reason, failure_count = EXCLUDED.failure_count, \
         retry_at = EXCLUDED.retry_at, updated_at = EXCLUDED.updated_at"
    } else {
        "ON CONFLICT (resource_id) DO UPDATE SET \
         claim_state = EXCLUDED.claim_state, last_claimed_job_id = EXCLUDED.last_claimed_job_id, \
         claimed_by = EXCLUDED.claimed_by, dispatched_at = EXCLUDED.dispatched_at, \
         success_signal_at = EXCLUDED.success_signal_at, \
         success_signal_job_id = EXCLUDED.success_signal_job_id, \
         failure_reason = EXCLUDED.failure_reason, failure_count = EXCLUDED.failure_count, \
         retry_at = EXCLUDED.retry_at, updated_at = EXCLUDED.updated_at"
    };

    sqlx::query(&format!(
        "INSERT INTO resource_claims ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) {conflict}"
    ))
    .bind(r.id.get())
    .bind(r.backlog_source.as_str())
    .bind(r.claim_state.as_str())
    .bind(r.last_claimed_job_id.as_ref().map(JobId::as_str))
    .bind(r.claimed_by.as_ref().map(HandlerId::as_str))
    .bind(r.dispatched_at)
    .bind(r.success_signal_at)
    .bind(r.success_signal_job_id.as_ref().map(JobId::as_str))
    .bind(r.failure_reason.as_deref())
    .bind(i32::try_from(r.failure_count).unwrap_or(i32::MAX))
    .bind(r.retry_at)
    .bind(r.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("write_claim", e))?;
    Ok(())
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Resource, ClaimStoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_claim", e);
    let bad = |e: syncwarden_core::CoreError| ClaimStoreError::Serialization(e.to_string());

    let state: String = row.try_get("claim_state").map_err(get_err)?;
    let job: Option<String> = row.try_get("last_claimed_job_id").map_err(get_err)?;
    let handler: Option<String> = row.try_get("claimed_by").map_err(get_err)?;
    let signal_job: Option<String> = row.try_get("success_signal_job_id").map_err(get_err)?;
    let source: String = row.try_get("backlog_source").map_err(get_err)?;
    let failure_count: i32 = row.try_get("failure_count").map_err(get_err)?;

    Ok(Resource {
        id: ResourceId::new(row.try_get("resource_id").map_err(get_err)?),
        backlog_source: BacklogSourceId::new(source).map_err(bad)?,
        claim_state: state.parse::<ClaimState>().map_err(bad)?,
        last_claimed_job_id: job.map(JobId::new).transpose().map_err(bad)?,
        claimed_by: handler.map(HandlerId::new).transpose().map_err(bad)?,
        dispatched_at: row.try_get("dispatched_at").map_err(get_err)?,
        success_signal_at: row.try_get("success_signal_at").map_err(get_err)?,
        success_signal_job_id: signal_job.map(JobId::new).transpose().map_err(bad)?,
        failure_reason: row.try_get("failure_reason").map_err(get_err)?,
        failure_count: u32::try_from(failure_count).unwrap_or(0),
        retry_at: row.try_get("retry_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ClaimStoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            ClaimStoreError::Serialization(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            ClaimStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            ClaimStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        other => ClaimStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

impl ClaimStore for PostgresClaimStore {
    fn get(
        &self,
        id: ResourceId,
        consistency: DataConsistency,
    ) -> Result<Option<Resource>, ClaimStoreError> {
        self.block_on(self.fetch(id, consistency))
    }

    fn insert(&self, resource: Resource) -> Result<(), ClaimStoreError> {
        self.block_on(self.upsert(&resource))
    }

    fn transition(
        &self,
        id: ResourceId,
        transition: &ClaimTransition,
    ) -> Result<Resource, ClaimStoreError> {
        self.block_on(self.apply_transition(id, transition))
    }

    fn record_success_signal(
        &self,
        id: ResourceId,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimStoreError> {
        self.block_on(self.store_success_signal(id, job_id, at))
    }

    fn find(&self, query: &ClaimQuery) -> Result<Vec<Resource>, ClaimStoreError> {
        self.block_on(self.query(query))
    }
}
