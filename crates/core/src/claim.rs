//! Resource claim model.
//!
//! A claim is the persisted assertion that a resource is owned by an in-flight
//! job. Every mutation goes through [`ClaimTransition::apply`], which is the
//! single definition of the legal state machine:
//!
//! ```text
//! idle | completed | failed --Claim--> claimed
//! claimed --Complete--> completed
//! claimed --Fail--> failed
//! claimed --ResetOrphan--> idle      (reconciler, below strike threshold)
//! failed --ManualReset--> idle       (operator)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{BacklogSourceId, HandlerId, JobId, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Idle,
    Claimed,
    Completed,
    Failed,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Idle => "idle",
            ClaimState::Claimed => "claimed",
            ClaimState::Completed => "completed",
            ClaimState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ClaimState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ClaimState::Idle),
            "claimed" => Ok(ClaimState::Claimed),
            "completed" => Ok(ClaimState::Completed),
            "failed" => Ok(ClaimState::Failed),
            other => Err(CoreError::validation(format!("unknown claim state: {other}"))),
        }
    }
}

/// An entity eligible for background processing, together with its claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub backlog_source: BacklogSourceId,
    pub claim_state: ClaimState,
    pub last_claimed_job_id: Option<JobId>,
    /// Handler type that owns the current (or last) claim.
    pub claimed_by: Option<HandlerId>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Set by the job runner as soon as the domain action succeeded.
    pub success_signal_at: Option<DateTime<Utc>>,
    /// Job that recorded `success_signal_at`.
    #[serde(default)]
    pub success_signal_job_id: Option<JobId>,
    pub failure_reason: Option<String>,
    /// Domain failures and orphan strikes since the last success.
    pub failure_count: u32,
    /// Earliest time a failed resource becomes eligible again; `None` on a
    /// failed resource means only an operator can retry it.
    pub retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(id: ResourceId, backlog_source: BacklogSourceId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            backlog_source,
            claim_state: ClaimState::Idle,
            last_claimed_job_id: None,
            claimed_by: None,
            dispatched_at: None,
            success_signal_at: None,
            success_signal_job_id: None,
            failure_reason: None,
            failure_count: 0,
            retry_at: None,
            updated_at: now,
        }
    }

    /// Whether the claim is held by exactly this job.
    pub fn is_claimed_by(&self, job_id: &JobId) -> bool {
        self.claim_state == ClaimState::Claimed && self.last_claimed_job_id.as_ref() == Some(job_id)
    }

    /// Whether the job holding the claim recorded a success signal.
    pub fn has_success_signal(&self) -> bool {
        self.claim_state == ClaimState::Claimed
            && self.success_signal_at.is_some()
            && self.success_signal_job_id.is_some()
            && self.success_signal_job_id == self.last_claimed_job_id
    }

    /// Record the success signal of `job_id`, which must hold the claim.
    pub fn record_success_signal(
        &mut self,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !self.is_claimed_by(job_id) {
            return Err(CoreError::invalid_transition(format!(
                "success signal of job {job_id} for resource {} claimed by {:?}",
                self.id,
                self.last_claimed_job_id.as_ref().map(JobId::as_str)
            )));
        }
        self.success_signal_at = Some(at);
        self.success_signal_job_id = Some(job_id.clone());
        self.updated_at = at;
        Ok(())
    }

    /// Whether a failed resource may be picked up again at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.claim_state == ClaimState::Failed && self.retry_at.is_some_and(|at| at <= now)
    }
}

/// A compare-and-set style claim mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTransition {
    Claim {
        job_id: JobId,
        handler: HandlerId,
        dispatched_at: DateTime<Utc>,
    },
    Complete {
        job_id: JobId,
    },
    Fail {
        job_id: JobId,
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },
    ResetOrphan {
        job_id: JobId,
        reason: String,
    },
    ManualReset,
}

impl ClaimTransition {
    pub fn name(&self) -> &'static str {
        match self {
            ClaimTransition::Claim { .. } => "claim",
            ClaimTransition::Complete { .. } => "complete",
            ClaimTransition::Fail { .. } => "fail",
            ClaimTransition::ResetOrphan { .. } => "reset_orphan",
            ClaimTransition::ManualReset => "manual_reset",
        }
    }

    /// The job id the resource must currently be claimed by, if any.
    pub fn expected_job_id(&self) -> Option<&JobId> {
        match self {
            ClaimTransition::Complete { job_id }
            | ClaimTransition::Fail { job_id, .. }
            | ClaimTransition::ResetOrphan { job_id, .. } => Some(job_id),
            ClaimTransition::Claim { .. } | ClaimTransition::ManualReset => None,
        }
    }

    /// Check whether this transition applies to `resource` as it is now.
    pub fn check(&self, resource: &Resource) -> Result<(), CoreError> {
        let ok = match self {
            ClaimTransition::Claim { .. } => resource.claim_state != ClaimState::Claimed,
            ClaimTransition::ManualReset => resource.claim_state == ClaimState::Failed,
            other => other
                .expected_job_id()
                .is_some_and(|job_id| resource.is_claimed_by(job_id)),
        };

        if ok {
            Ok(())
        } else {
            Err(CoreError::invalid_transition(format!(
                "{} not applicable to resource {} in state {} (job {:?})",
                self.name(),
                resource.id,
                resource.claim_state,
                resource.last_claimed_job_id.as_ref().map(JobId::as_str)
            )))
        }
    }

    /// Apply the transition, or leave the resource untouched and return an error.
    pub fn apply(&self, resource: &mut Resource, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.check(resource)?;

        match self {
            ClaimTransition::Claim {
                job_id,
                handler,
                dispatched_at,
            } => {
                resource.claim_state = ClaimState::Claimed;
                resource.last_claimed_job_id = Some(job_id.clone());
                resource.claimed_by = Some(handler.clone());
                resource.dispatched_at = Some(*dispatched_at);
                resource.success_signal_at = None;
                resource.success_signal_job_id = None;
                resource.retry_at = None;
            }
            ClaimTransition::Complete { .. } => {
                resource.claim_state = ClaimState::Completed;
                resource.failure_reason = None;
                resource.failure_count = 0;
                resource.retry_at = None;
            }
            ClaimTransition::Fail {
                reason, retry_at, ..
            } => {
                resource.claim_state = ClaimState::Failed;
                resource.failure_reason = Some(reason.clone());
                resource.failure_count = resource.failure_count.saturating_add(1);
                resource.retry_at = *retry_at;
            }
            ClaimTransition::ResetOrphan { reason, .. } => {
                resource.claim_state = ClaimState::Idle;
                resource.failure_reason = Some(reason.clone());
                resource.failure_count = resource.failure_count.saturating_add(1);
                resource.retry_at = None;
            }
            ClaimTransition::ManualReset => {
                resource.claim_state = ClaimState::Idle;
                resource.failure_reason = None;
                resource.failure_count = 0;
                resource.retry_at = None;
            }
        }

        resource.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> Resource {
        Resource::new(ResourceId::new(7), BacklogSourceId::new("unsynced").unwrap(), Utc::now())
    }

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn claim(job_id: &str) -> ClaimTransition {
        ClaimTransition::Claim {
            job_id: job(job_id),
            handler: HandlerId::new("geo.repository_sync").unwrap(),
            dispatched_at: Utc::now(),
        }
    }

    #[test]
    fn claim_then_complete() {
        let mut r = resource();
        claim("abc123").apply(&mut r, Utc::now()).unwrap();
        assert_eq!(r.claim_state, ClaimState::Claimed);
        assert!(r.is_claimed_by(&job("abc123")));

        ClaimTransition::Complete { job_id: job("abc123") }
            .apply(&mut r, Utc::now())
            .unwrap();
        assert_eq!(r.claim_state, ClaimState::Completed);
        assert_eq!(r.failure_count, 0);
    }

    #[test]
    fn claimed_resource_cannot_be_claimed_twice() {
        let mut r = resource();
        claim("first").apply(&mut r, Utc::now()).unwrap();

        let err = claim("second").apply(&mut r, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
        assert!(r.is_claimed_by(&job("first")));
    }

    #[test]
    fn completion_by_a_stale_job_is_rejected() {
        let mut r = resource();
        claim("current").apply(&mut r, Utc::now()).unwrap();

        let stale = ClaimTransition::Complete { job_id: job("previous") };
        assert!(stale.apply(&mut r, Utc::now()).is_err());
        assert_eq!(r.claim_state, ClaimState::Claimed);
    }

    #[test]
    fn failure_records_reason_and_counts() {
        let mut r = resource();
        claim("j1").apply(&mut r, Utc::now()).unwrap();
        ClaimTransition::Fail {
            job_id: job("j1"),
            reason: "remote unreachable".to_string(),
            retry_at: None,
        }
        .apply(&mut r, Utc::now())
        .unwrap();

        assert_eq!(r.claim_state, ClaimState::Failed);
        assert_eq!(r.failure_reason.as_deref(), Some("remote unreachable"));
        assert_eq!(r.failure_count, 1);
        assert!(!r.is_retry_due(Utc::now()));

        ClaimTransition::ManualReset.apply(&mut r, Utc::now()).unwrap();
        assert_eq!(r.claim_state, ClaimState::Idle);
        assert_eq!(r.failure_count, 0);
    }

    #[test]
    fn success_signal_belongs_to_the_claiming_job() {
        let mut r = resource();
        claim("j1").apply(&mut r, Utc::now()).unwrap();

        assert!(r.record_success_signal(&job("stale"), Utc::now()).is_err());
        assert!(!r.has_success_signal());

        r.record_success_signal(&job("j1"), Utc::now()).unwrap();
        assert!(r.has_success_signal());
    }

    #[test]
    fn reclaim_clears_previous_success_signal() {
        let mut r = resource();
        claim("j1").apply(&mut r, Utc::now()).unwrap();
        r.record_success_signal(&job("j1"), Utc::now()).unwrap();
        ClaimTransition::ResetOrphan {
            job_id: job("j1"),
            reason: "orphaned".into(),
        }
        .apply(&mut r, Utc::now())
        .unwrap();

        claim("j2").apply(&mut r, Utc::now()).unwrap();
        assert!(!r.has_success_signal());
        assert!(r.record_success_signal(&job("j1"), Utc::now()).is_err());
        assert!(r.success_signal_job_id.is_none());
    }
}
