//! Adapts one trigger fire into one tracked run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::error;

use crate::context::Context;
use crate::error::JobError;
use crate::execution::Execution;
use crate::job::Job;
use crate::scheduler::Scheduler;

/// Drives a single run of `job`: in-flight registration, execution record,
/// middleware chain, and history bookkeeping.
pub struct JobWrapper {
    scheduler: Scheduler,
    job: Arc<dyn Job>,
}

impl JobWrapper {
    pub fn new(scheduler: Scheduler, job: Arc<dyn Job>) -> Self {
        Self { scheduler, job }
    }

    /// Run once and return the finished execution, already appended to the
    /// job's history.
    pub async fn run(self) -> Arc<Execution> {
        // Held until the history append below; `Scheduler::stop` drains on it.
        let _in_flight = self.scheduler.track_run();

        let mut ctx = Context::new(
            self.scheduler.clone(),
            Arc::clone(&self.job),
            Execution::new(),
        );

        self.start(&mut ctx);
        let result = match AssertUnwindSafe(ctx.next()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(job = %self.job.name(), %reason, "run panicked");
                Err(JobError::Panicked(reason))
            }
        };
        self.stop(ctx, result)
    }

    fn start(&self, ctx: &mut Context) {
        ctx.start();
        ctx.log(format!("Started - {}", self.job.command()));
    }

    fn stop(&self, mut ctx: Context, result: Result<(), JobError>) -> Arc<Execution> {
        ctx.stop(result.as_ref().err());

        let output = ctx.execution.output.as_str();
        if !output.is_empty() {
            ctx.log(format!("Output: {output}"));
        }
        let stderr = ctx.execution.error_output.as_str();
        if !stderr.is_empty() {
            ctx.log(format!("Stderr: {stderr}"));
        }

        let e = &ctx.execution;
        ctx.log(format!(
            "Finished in {:?}, failed: {}, skipped: {}, error: {}",
            e.duration,
            e.failed,
            e.skipped,
            e.error.as_deref().unwrap_or("none"),
        ));

        let execution = Arc::new(ctx.execution);
        self.job.add_history(vec![Arc::clone(&execution)]);
        execution
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
