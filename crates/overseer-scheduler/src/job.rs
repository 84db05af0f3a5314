//! The job capability set and the shared state every job kind embeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::context::{Context, Middleware};
use crate::error::JobError;
use crate::execution::Execution;

/// A schedulable unit of work.
///
/// Implementors embed a [`BareJob`] and expose it through [`Job::bare`]; every
/// other accessor is provided on top of it. Only the body, [`Job::run`], is
/// specific to the job kind.
#[async_trait]
pub trait Job: Send + Sync {
    fn bare(&self) -> &BareJob;

    /// The job body. Writes its output into `ctx.execution`.
    async fn run(&self, ctx: &mut Context) -> Result<(), JobError>;

    fn name(&self) -> &str {
        self.bare().name()
    }

    fn schedule(&self) -> &str {
        self.bare().schedule()
    }

    fn command(&self) -> &str {
        self.bare().command()
    }

    fn run_on_start(&self) -> bool {
        self.bare().run_on_start()
    }

    fn history(&self) -> Vec<Arc<Execution>> {
        self.bare().history()
    }

    fn add_history(&self, executions: Vec<Arc<Execution>>) {
        self.bare().add_history(executions)
    }

    fn running(&self) -> usize {
        self.bare().running()
    }

    fn notify_start(&self) {
        self.bare().notify_start()
    }

    fn notify_stop(&self) {
        self.bare().notify_stop()
    }

    fn use_middlewares(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        self.bare().use_middlewares(middlewares)
    }

    fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.bare().middlewares()
    }
}

/// Shared base state: identity, middleware list, history and running counter.
///
/// History and the counter are synchronized independently; neither lock is
/// ever held while a job body runs.
pub struct BareJob {
    name: String,
    schedule: String,
    command: String,
    run_on_start: bool,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    history: Mutex<Vec<Arc<Execution>>>,
    running: AtomicUsize,
}

impl BareJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            command: command.into(),
            run_on_start: false,
            middlewares: RwLock::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
        }
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn run_on_start(&self) -> bool {
        self.run_on_start
    }

    /// Copy of the history at the time of the call, in completion order.
    pub fn history(&self) -> Vec<Arc<Execution>> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_history(&self, executions: impl IntoIterator<Item = Arc<Execution>>) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(executions);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn notify_start(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero; an unpaired stop is logged instead of wrapping.
    pub fn notify_stop(&self) {
        let prev = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!(job = %self.name, "notify_stop without matching notify_start");
        }
    }

    /// Increment the running counter for the lifetime of the returned guard.
    pub fn enter(&self) -> RunningGuard<'_> {
        self.notify_start();
        RunningGuard { job: self }
    }

    /// Claim the counter only if no other run holds it (`0 → 1` in one CAS).
    pub fn try_enter_exclusive(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard { job: self })
    }

    pub fn use_middlewares(&self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(middlewares);
    }

    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Decrements the owning job's running counter when dropped, including on
/// error and panic paths.
#[must_use = "the running counter is released as soon as the guard is dropped"]
pub struct RunningGuard<'a> {
    job: &'a BareJob,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.job.notify_stop();
    }
}
