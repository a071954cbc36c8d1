//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syncwarden_core::{HandlerId, JobId, ResourceId};

/// Liveness of a submitted job as reported by the job status backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, waiting to be picked up
    Queued,
    /// Currently being executed
    Running,
    /// Finished (successfully or not)
    Completed,
    /// The backend has no record of the job
    Unknown,
}

impl JobStatus {
    /// Queued or running jobs may still update their claim.
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a job: the resource it acts on plus domain arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    pub resource_id: Option<ResourceId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Submitted through the deduplicator; the execution owns the dedup
    /// marker and clears it once the action ran.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub deduplicated: bool,
}

impl JobArgs {
    pub fn for_resource(resource_id: ResourceId) -> Self {
        Self {
            resource_id: Some(resource_id),
            payload: serde_json::Value::Null,
            deduplicated: false,
        }
    }

    /// Arguments of a job that is not bound to a single resource.
    pub fn unbound(payload: serde_json::Value) -> Self {
        Self {
            resource_id: None,
            payload,
            deduplicated: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn mark_deduplicated(mut self) -> Self {
        self.deduplicated = true;
        self
    }
}

/// A job as handed to a worker by the queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub handler: HandlerId,
    pub args: JobArgs,
    pub enqueued_at: DateTime<Utc>,
}

/// What happened to a job the runner picked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The action succeeded; `claim_updated` is false if the claim had been
    /// repaired or re-dispatched in the meantime.
    Completed { claim_updated: bool },
    /// The action did not run.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another execution holds the per-resource lease.
    LeaseHeld,
    /// The claim no longer belongs to this job.
    StaleClaim,
    /// The resource does not exist.
    ResourceMissing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_and_running_are_live() {
        assert!(JobStatus::Queued.is_live());
        assert!(JobStatus::Running.is_live());
        assert!(!JobStatus::Completed.is_live());
        assert!(!JobStatus::Unknown.is_live());
    }

    #[test]
    fn envelope_serializes_for_the_wire() {
        let envelope = JobEnvelope {
            job_id: JobId::new("abc123").unwrap(),
            handler: HandlerId::new("geo.repository_sync").unwrap(),
            args: JobArgs::for_resource(ResourceId::new(9)),
            enqueued_at: Utc::now(),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["job_id"], "abc123");
        assert_eq!(json["handler"], "geo.repository_sync");
        assert_eq!(json["args"]["resource_id"], 9);
        assert!(json["args"].get("deduplicated").is_none());

        let back: JobEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn dedup_ownership_travels_with_the_args() {
        let args = JobArgs::for_resource(ResourceId::new(9)).mark_deduplicated();
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["deduplicated"], true);
        assert!(serde_json::from_value::<JobArgs>(json).unwrap().deduplicated);
    }
}
