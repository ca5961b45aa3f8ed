//! Unordered background jobs.
//!
//! Completion and diagnostics requests run here instead of on the execution
//! slot so they never wait behind a long-running cell. Jobs may run in
//! parallel with each other and with the scheduled task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Launches fire-and-forget jobs on a tokio runtime.
///
/// Uses the ambient runtime when constructed inside one, otherwise owns a
/// small multi-threaded runtime of its own.
pub struct JobLauncher {
    handle: Handle,
    owned: Mutex<Option<Runtime>>,
    jobs: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl JobLauncher {
    /// Create a launcher bound to the current runtime, or a private one.
    pub fn new() -> Result<Self> {
        let (handle, owned) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("ember-jobs")
                    .enable_all()
                    .build()
                    .map_err(|e| Error::JobRuntime(e.to_string()))?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        Ok(Self {
            handle,
            owned: Mutex::new(owned),
            jobs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Launch an async job.
    pub fn launch<F>(&self, name: &str, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SchedulerClosed);
        }
        tracing::debug!(job = name, "launching job");

        let handle = self.handle.spawn(job);
        let mut jobs = lock(&self.jobs);
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle.abort_handle());
        Ok(())
    }

    /// Launch a blocking closure as a job.
    pub fn launch_blocking<F>(&self, name: &str, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job_name = name.to_string();
        self.launch(name, async move {
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::warn!(job = %job_name, "job failed: {}", e);
            }
        })
    }

    /// Number of jobs that have not finished yet.
    pub fn active_jobs(&self) -> usize {
        lock(&self.jobs).iter().filter(|job| !job.is_finished()).count()
    }

    /// Abort outstanding jobs and release the private runtime, if any.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for job in lock(&self.jobs).drain(..) {
            job.abort();
        }
        if let Some(runtime) = lock(&self.owned).take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for JobLauncher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
