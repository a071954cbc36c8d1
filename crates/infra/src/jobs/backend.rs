//! Job queue and job status backend contracts, plus an in-memory backend.
//!
//! The real backends (a Sidekiq-like broker) are external collaborators; the
//! dispatch layer only depends on these narrow traits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use syncwarden_core::{Clock, HandlerId, JobId, ResourceId};

use super::types::{JobArgs, JobEnvelope, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Request timeouts count as unavailability, never as "job is running".
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Submission side of the job queue (at-least-once delivery).
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, handler: &HandlerId, args: &JobArgs) -> Result<JobId, BackendError>;

    /// Submit a batch in order, stopping at the first refusal. Jobs accepted
    /// before the refusal stay queued.
    ///
    /// For embedding applications that enqueue work outside the dispatch
    /// layer. The scheduler submits one resource at a time so that a single
    /// refusal only costs that resource its slot.
    fn bulk_enqueue(&self, jobs: &[(HandlerId, JobArgs)]) -> Result<Vec<JobId>, BackendError> {
        jobs.iter()
            .map(|(handler, args)| self.enqueue(handler, args))
            .collect()
    }
}

/// Liveness queries for previously submitted jobs.
pub trait JobStatusBackend: Send + Sync {
    fn status(&self, job_id: &JobId) -> Result<JobStatus, BackendError>;

    /// One round trip for many ids; ids the backend does not know map to
    /// `Unknown`.
    fn bulk_status(&self, job_ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, BackendError>;
}

/// Consumer side of the job queue, used by workers.
pub trait JobSource: Send + Sync {
    /// Take the next queued job and mark it running.
    fn fetch_next(&self) -> Result<Option<JobEnvelope>, BackendError>;

    /// Mark a fetched job as finished.
    fn acknowledge(&self, job_id: &JobId) -> Result<(), BackendError>;
}

impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    fn enqueue(&self, handler: &HandlerId, args: &JobArgs) -> Result<JobId, BackendError> {
        (**self).enqueue(handler, args)
    }

    fn bulk_enqueue(&self, jobs: &[(HandlerId, JobArgs)]) -> Result<Vec<JobId>, BackendError> {
        (**self).bulk_enqueue(jobs)
    }
}

impl<T: JobStatusBackend + ?Sized> JobStatusBackend for Arc<T> {
    fn status(&self, job_id: &JobId) -> Result<JobStatus, BackendError> {
        (**self).status(job_id)
    }

    fn bulk_status(&self, job_ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, BackendError> {
        (**self).bulk_status(job_ids)
    }
}

impl<T: JobSource + ?Sized> JobSource for Arc<T> {
    fn fetch_next(&self) -> Result<Option<JobEnvelope>, BackendError> {
        (**self).fetch_next()
    }

    fn acknowledge(&self, job_id: &JobId) -> Result<(), BackendError> {
        (**self).acknowledge(job_id)
    }
}

#[derive(Debug, Default)]
struct BackendState {
    queue: VecDeque<JobId>,
    jobs: HashMap<JobId, (JobEnvelope, JobStatus)>,
    unavailable: bool,
    rejected_resources: HashSet<ResourceId>,
    submitted: Vec<JobId>,
}

/// In-memory queue + status backend for tests and single-process use.
///
/// Supports fault injection: whole-backend outages (`set_available`), per
/// resource enqueue rejections (`reject_resource`) and lost jobs (`forget`).
pub struct InMemoryJobBackend {
    state: Mutex<BackendState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackendState>, BackendError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BackendError::Unavailable("backend state lock poisoned".into()))?;
        if state.unavailable {
            return Err(BackendError::Unavailable("backend marked unavailable".into()));
        }
        Ok(state)
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Make every enqueue for `resource_id` fail.
    pub fn reject_resource(&self, resource_id: ResourceId) {
        self.state().rejected_resources.insert(resource_id);
    }

    /// Drop all record of a job, as if the process running it died and the
    /// backend lost it.
    pub fn forget(&self, job_id: &JobId) {
        let mut state = self.state();
        state.jobs.remove(job_id);
        state.queue.retain(|id| id != job_id);
    }

    /// Force a job's status.
    pub fn set_status(&self, job_id: &JobId, status: JobStatus) {
        if let Some(entry) = self.state().jobs.get_mut(job_id) {
            entry.1 = status;
        }
    }

    pub fn envelope(&self, job_id: &JobId) -> Option<JobEnvelope> {
        self.state().jobs.get(job_id).map(|(envelope, _)| envelope.clone())
    }

    /// Every job id ever accepted, in submission order.
    pub fn submitted(&self) -> Vec<JobId> {
        self.state().submitted.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.state().queue.len()
    }
}

impl core::fmt::Debug for InMemoryJobBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryJobBackend").finish_non_exhaustive()
    }
}

impl JobQueue for InMemoryJobBackend {
    fn enqueue(&self, handler: &HandlerId, args: &JobArgs) -> Result<JobId, BackendError> {
        let mut state = self.lock()?;

        if let Some(resource_id) = args.resource_id {
            if state.rejected_resources.contains(&resource_id) {
                return Err(BackendError::Rejected(format!(
                    "enqueue refused for resource {resource_id}"
                )));
            }
        }

        let job_id = JobId::generate();
        let envelope = JobEnvelope {
            job_id: job_id.clone(),
            handler: handler.clone(),
            args: args.clone(),
            enqueued_at: self.clock.now(),
        };
        state.jobs.insert(job_id.clone(), (envelope, JobStatus::Queued));
        state.queue.push_back(job_id.clone());
        state.submitted.push(job_id.clone());
        Ok(job_id)
    }
}

impl JobStatusBackend for InMemoryJobBackend {
    fn status(&self, job_id: &JobId) -> Result<JobStatus, BackendError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .get(job_id)
            .map(|(_, status)| *status)
            .unwrap_or(JobStatus::Unknown))
    }

    fn bulk_status(&self, job_ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, BackendError> {
        let state = self.lock()?;
        Ok(job_ids
            .iter()
            .map(|id| {
                let status = state
                    .jobs
                    .get(id)
                    .map(|(_, status)| *status)
                    .unwrap_or(JobStatus::Unknown);
                (id.clone(), status)
            })
            .collect())
    }
}

impl JobSource for InMemoryJobBackend {
    fn fetch_next(&self) -> Result<Option<JobEnvelope>, BackendError> {
        let mut state = self.lock()?;

        while let Some(job_id) = state.queue.pop_front() {
            if let Some((envelope, status)) = state.jobs.get_mut(&job_id) {
                *status = JobStatus::Running;
                return Ok(Some(envelope.clone()));
            }
        }
        Ok(None)
    }

    fn acknowledge(&self, job_id: &JobId) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.jobs.get_mut(job_id) {
            entry.1 = JobStatus::Completed;
        }
        Ok(())
    }
}
