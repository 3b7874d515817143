//! Periodic task scheduler
//!
//! Runs named jobs at fixed intervals until stopped.
//!
//! ## Execution model
//!
//! - Every job has its own loop task and its own interval timer
//! - A job never overlaps with itself; a slow run delays the next tick
//! - Different jobs run concurrently and never block each other
//! - The first run happens one interval after `start()`
//! - Each run executes in a spawned task: an error or a panic is logged
//!   and the loop carries on with the next tick
//!
//! There is no retry inside a tick; a failed run is simply tried again at
//! the next interval.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    name: String,
    interval: Duration,
    run: JobFn,
}

/// Runs periodic jobs on the tokio runtime
pub struct TaskScheduler {
    jobs: Vec<Job>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a job
    ///
    /// Jobs added after [`start`](Self::start) are not run.
    pub fn add_job<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.push(Job {
            name: name.into(),
            interval,
            run: Arc::new(move || Box::pin(job()) as JobFuture),
        });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.name.as_str()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.shutdown.is_cancelled()
    }

    /// Spawn one loop per registered job and return immediately
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(Error::invalid_state("scheduler already started"));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::invalid_state("scheduler was stopped"));
        }

        for job in &self.jobs {
            if job.interval.is_zero() {
                return Err(Error::config(format!("job {} has a zero interval", job.name)));
            }
        }

        for job in &self.jobs {
            info!("Scheduling {} every {:?}", job.name, job.interval);
            self.handles.push(tokio::spawn(run_job(
                job.name.clone(),
                job.interval,
                Arc::clone(&job.run),
                self.shutdown.clone(),
            )));
        }
        Ok(())
    }

    /// Stop all loops
    ///
    /// In-flight runs get up to `grace` to finish; anything still running
    /// afterwards is aborted and reported as [`Error::Timeout`].
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();

        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduler loop ended abnormally: {}", e),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            warn!("Aborted {} job(s) still running after {:?}", aborted, grace);
            return Err(Error::timeout(format!(
                "{} job(s) did not finish within {:?}",
                aborted, grace
            )));
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Aborts the in-flight run when its loop is aborted
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job(name: String, period: Duration, job: JobFn, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Job {} stopping", name);
                return;
            }
            _ = interval.tick() => {}
        }

        let mut execution = tokio::spawn((job)());
        let _abort = AbortOnDrop(execution.abort_handle());
        tokio::select! {
            result = &mut execution => match result {
                Ok(Ok(())) => debug!("Job {} finished", name),
                Ok(Err(e)) => warn!("Job {} failed: {}", name, e),
                Err(e) if e.is_panic() => error!("Job {} panicked", name),
                Err(e) => error!("Job {} was cancelled: {}", name, e),
            },
            // Let the in-flight run finish; stop() aborts it if the grace
            // period runs out
            _ = shutdown.cancelled() => {
                match execution.await {
                    Ok(Err(e)) => warn!("Job {} failed: {}", name, e),
                    Err(e) if e.is_panic() => error!("Job {} panicked", name),
                    _ => {}
                }
                return;
            }
        }
    }
}
