//! Job registry, lifecycle and shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures_util::FutureExt;
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};
use tracing::{debug, info};

use crate::context::Middleware;
use crate::error::{Result, SchedulerError};
use crate::execution::Execution;
use crate::job::Job;
use crate::trigger::{Callback, CronEngine, EntryInfo};
use crate::wrapper::JobWrapper;

/// Cheaply cloneable handle to a scheduler. Clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: RwLock<Vec<Arc<dyn Job>>>,
    /// Appended to every job's own middlewares on `start`.
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    cron: CronEngine,
    in_flight: TaskTracker,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(Vec::new()),
                middlewares: Mutex::new(Vec::new()),
                cron: CronEngine::new(),
                in_flight: TaskTracker::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register `job` with the trigger engine and the registry.
    ///
    /// The same schedule may be shared by many jobs; each fires on its own.
    pub fn add_job(&self, job: Arc<dyn Job>) -> Result<()> {
        if job.schedule().trim().is_empty() {
            return Err(SchedulerError::EmptySchedule {
                name: job.name().to_string(),
            });
        }

        let callback = self.fire_callback(Arc::clone(&job));
        self.inner.cron.add(job.schedule(), callback)?;

        info!(
            job = %job.name(),
            command = %job.command(),
            schedule = %job.schedule(),
            "New job registered"
        );
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }

    /// Merge global middlewares, start the trigger engine, then run every
    /// run-on-start job once before returning.
    pub async fn start(&self) -> Result<()> {
        let jobs = self.jobs();
        if jobs.is_empty() {
            return Err(SchedulerError::EmptyScheduler);
        }

        debug!(count = jobs.len(), "Starting scheduler");
        self.merge_middlewares(&jobs);
        self.inner.running.store(true, Ordering::Release);
        self.inner.cron.start();

        for job in jobs.into_iter().filter(|j| j.run_on_start()) {
            debug!(job = %job.name(), "run on start");
            self.run_job(job).await;
        }
        Ok(())
    }

    /// Wait for every in-flight run to finish, then stop the trigger engine.
    ///
    /// Triggers keep firing while this waits and those runs are waited for
    /// as well. Callers that need a hard stop must keep new work from being
    /// scheduled before calling this.
    pub async fn stop(&self) -> Result<()> {
        self.inner.in_flight.close();
        self.inner.in_flight.wait().await;
        self.inner.in_flight.reopen();

        self.inner.cron.stop();
        self.inner.running.store(false, Ordering::Release);
        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Add scheduler-wide middlewares. They reach jobs at the next `start`.
    pub fn use_middlewares(&self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        self.inner
            .middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(middlewares);
    }

    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner
            .middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registry snapshot in registration order.
    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn job(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|j| j.name() == name)
            .cloned()
    }

    /// Trigger engine entries with their next fire times.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.inner.cron.entries()
    }

    /// Run `job` once through the same path a trigger fire takes.
    pub async fn run_job(&self, job: Arc<dyn Job>) -> Arc<Execution> {
        JobWrapper::new(self.clone(), job).run().await
    }

    /// Trigger callback for `job`.
    ///
    /// The in-flight registration is taken when the engine fires, before the
    /// run's task is first polled, so a concurrent `stop` always waits for it.
    /// Holds the scheduler weakly; fires after it is dropped do nothing.
    fn fire_callback(&self, job: Arc<dyn Job>) -> Callback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let fired = weak.upgrade().map(|inner| {
                let in_flight = inner.in_flight.token();
                (Scheduler { inner }, in_flight)
            });
            let job = Arc::clone(&job);
            async move {
                if let Some((scheduler, _in_flight)) = fired {
                    scheduler.run_job(job).await;
                }
            }
            .boxed()
        })
    }

    /// Register one in-flight run; released when the token is dropped.
    pub(crate) fn track_run(&self) -> TaskTrackerToken {
        self.inner.in_flight.token()
    }

    /// Job-specific middlewares stay at the head of each chain.
    fn merge_middlewares(&self, jobs: &[Arc<dyn Job>]) {
        let global = self.middlewares();
        if global.is_empty() {
            return;
        }
        for job in jobs {
            job.use_middlewares(global.clone());
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
