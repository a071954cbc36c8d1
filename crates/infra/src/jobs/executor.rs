//! Job worker: pulls envelopes from a [`JobSource`] and runs them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::claims::ClaimStore;
use crate::error::DispatchError;
use crate::lease::LeaseStore;

use super::backend::{BackendError, JobSource};
use super::runner::JobRunner;
use super::types::{JobEnvelope, JobOutcome};

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Sleep between polls when the queue is empty or unreachable
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_skipped: u64,
    pub jobs_failed: u64,
    pub jobs_panicked: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Executed) {
        self.jobs_processed += 1;
        match result {
            Executed::Finished(Ok(JobOutcome::Completed { .. })) => self.jobs_completed += 1,
            Executed::Finished(Ok(JobOutcome::Skipped(_))) => self.jobs_skipped += 1,
            Executed::Finished(Err(_)) => self.jobs_failed += 1,
            Executed::Panicked => self.jobs_panicked += 1,
        }
    }
}

/// Result of running one envelope.
#[derive(Debug)]
pub enum Executed {
    Finished(Result<JobOutcome, DispatchError>),
    /// The handler panicked. The job is acknowledged without touching its
    /// claim, exactly like a worker process that died mid-job.
    Panicked,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct JobWorker<S, C, L> {
    source: S,
    runner: JobRunner<C, L>,
}

impl<S, C, L> JobWorker<S, C, L>
where
    S: JobSource + 'static,
    C: ClaimStore + 'static,
    L: LeaseStore + 'static,
{
    pub fn new(source: S, runner: JobRunner<C, L>) -> Self {
        Self { source, runner }
    }

    /// Fetch and run a single job, if one is queued.
    pub fn run_once(&self) -> Result<Option<(JobEnvelope, Executed)>, BackendError> {
        let Some(envelope) = self.source.fetch_next()? else {
            return Ok(None);
        };

        debug!(job_id = %envelope.job_id, handler = %envelope.handler, "picked up job");
        let executed = match catch_unwind(AssertUnwindSafe(|| self.runner.run(&envelope))) {
            Ok(result) => Executed::Finished(result),
            Err(_) => {
                error!(job_id = %envelope.job_id, handler = %envelope.handler, "job handler panicked");
                Executed::Panicked
            }
        };

        match &executed {
            Executed::Finished(Err(err)) if err.is_transient() => {
                warn!(job_id = %envelope.job_id, error = %err, "job hit an infrastructure error");
            }
            Executed::Finished(Err(err)) => {
                debug!(job_id = %envelope.job_id, error = %err, "job failed");
            }
            _ => {}
        }

        self.source.acknowledge(&envelope.job_id)?;
        Ok(Some((envelope, executed)))
    }

    /// Drain the queue synchronously; returns the number of jobs run.
    pub fn run_until_idle(&self) -> Result<usize, BackendError> {
        let mut count = 0;
        while self.run_once()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Spawn the worker loop on its own thread.
    pub fn spawn(self, config: JobWorkerConfig) -> std::io::Result<JobWorkerHandle>
    where
        S: Send,
        C: Send,
        L: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(JobWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S, C, L>(
    worker: JobWorker<S, C, L>,
    config: JobWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: JobSource + 'static,
    C: ClaimStore + 'static,
    L: LeaseStore + 'static,
{
    info!(worker = %config.name, "job worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let idle = match worker.run_once() {
            Ok(Some((_, executed))) => {
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.record(&executed);
                false
            }
            Ok(None) => true,
            Err(err) => {
                error!(worker = %config.name, error = %err, "failed to fetch job");
                true
            }
        };

        stats.lock().unwrap_or_else(|e| e.into_inner()).uptime_secs =
            start_time.elapsed().as_secs();

        if idle {
            match shutdown_rx.recv_timeout(config.poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!(worker = %config.name, "job worker stopped");
}

impl<S, C, L> core::fmt::Debug for JobWorker<S, C, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobWorker")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
