//! Per-run context and the middleware chain-of-responsibility.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::execution::Execution;
use crate::job::Job;
use crate::scheduler::Scheduler;

/// An interceptor wrapped around every run of a job.
///
/// Implementations may do work before and after calling `next.run(ctx)`, or
/// return without calling it to short-circuit: the job body and every later
/// middleware are then skipped and the run's outcome is whatever this
/// middleware leaves in `ctx.execution` plus its own return value.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn run(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), JobError>;

    /// Label used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The remainder of a chain: middlewares not yet entered plus the job body.
///
/// `Copy`, so a middleware may drive the rest of the chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    job: &'a dyn Job,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], job: &'a dyn Job) -> Self {
        Self { middlewares, job }
    }

    /// Middlewares still ahead of the job body.
    pub fn remaining(&self) -> usize {
        self.middlewares.len()
    }

    /// Enter the next middleware, or the job body once none remain.
    pub async fn run(self, ctx: &mut Context) -> Result<(), JobError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                debug!(middleware = head.name(), job = %ctx.job.name(), "entering middleware");
                head.run(ctx, Next::new(rest, self.job)).await
            }
            None => self.job.run(ctx).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.middlewares.len())
            .field("job", &self.job.name())
            .finish()
    }
}

/// Everything one run needs: the owning scheduler, the job and its execution.
///
/// Owned by the wrapper for the duration of a single run.
pub struct Context {
    pub scheduler: Scheduler,
    pub job: Arc<dyn Job>,
    pub execution: Execution,
}

impl Context {
    pub fn new(scheduler: Scheduler, job: Arc<dyn Job>, execution: Execution) -> Self {
        Self {
            scheduler,
            job,
            execution,
        }
    }

    pub fn start(&mut self) {
        self.execution.start();
        debug!(job = %self.job.name(), execution = %self.execution.id, "execution started");
    }

    /// Close the execution. `err` decides the failed flag; skipped is untouched.
    pub fn stop(&mut self, err: Option<&JobError>) {
        self.execution.stop(err);
    }

    /// Run the job's whole middleware chain, ending in the job body.
    ///
    /// The chain is a snapshot of the job's middlewares taken at this call.
    pub async fn next(&mut self) -> Result<(), JobError> {
        let job = Arc::clone(&self.job);
        let middlewares = job.middlewares();
        Next::new(&middlewares, job.as_ref()).run(self).await
    }

    pub fn log(&self, msg: impl fmt::Display) {
        info!(job = %self.job.name(), execution = %self.execution.id, "{msg}");
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        warn!(job = %self.job.name(), execution = %self.execution.id, "{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BareJob;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingJob {
        bare: BareJob,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingJob {
        fn new(fail: bool) -> Self {
            Self {
                bare: BareJob::new("counting", "@hourly", "count"),
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn bare(&self) -> &BareJob {
            &self.bare
        }

        async fn run(&self, ctx: &mut Context) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.execution.output.push_str("body ran\n");
            if self.fail {
                Err(JobError::failed("boom"))
            } else {
                Ok(())
            }
        }
    }

    /// Records enter/leave markers into a shared trace.
    struct Marker {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Marker {
        async fn run(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), JobError> {
            self.trace.lock().unwrap().push(format!("{}:before", self.label));
            let result = next.run(ctx).await;
            self.trace.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn run(&self, ctx: &mut Context, _next: Next<'_>) -> Result<(), JobError> {
            ctx.execution.mark_skipped();
            Ok(())
        }
    }

    struct Retry;

    #[async_trait]
    impl Middleware for Retry {
        async fn run(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), JobError> {
            match next.run(ctx).await {
                Ok(()) => Ok(()),
                Err(_) => next.run(ctx).await,
            }
        }
    }

    fn context_for(job: Arc<dyn Job>) -> Context {
        Context::new(Scheduler::new(), job, Execution::new())
    }

    #[tokio::test]
    async fn empty_chain_runs_body() {
        let job = Arc::new(CountingJob::new(false));
        let mut ctx = context_for(job.clone());

        ctx.next().await.unwrap();
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.execution.output.as_str(), "body ran\n");
    }

    #[tokio::test]
    async fn middlewares_nest_in_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let job = Arc::new(CountingJob::new(false));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Marker { label: "outer", trace: trace.clone() }),
            Arc::new(Marker { label: "inner", trace: trace.clone() }),
        ];
        job.use_middlewares(chain);

        let mut ctx = context_for(job.clone());
        ctx.next().await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_body_and_later_middlewares() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let job = Arc::new(CountingJob::new(false));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ShortCircuit),
            Arc::new(Marker { label: "late", trace: trace.clone() }),
        ];
        job.use_middlewares(chain);

        let mut ctx = context_for(job.clone());
        let result = ctx.next().await;

        assert!(result.is_ok());
        assert!(ctx.execution.skipped);
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_error_reaches_caller() {
        let job = Arc::new(CountingJob::new(true));
        let mut ctx = context_for(job);

        let err = ctx.next().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn continuation_is_replayable() {
        let job = Arc::new(CountingJob::new(true));
        job.use_middlewares(vec![Arc::new(Retry) as Arc<dyn Middleware>]);

        let mut ctx = context_for(job.clone());
        assert!(ctx.next().await.is_err());
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_records_failure_without_touching_skip() {
        let job = Arc::new(CountingJob::new(true));
        let mut ctx = context_for(job);

        ctx.start();
        let result = ctx.next().await;
        ctx.stop(result.as_ref().err());

        assert!(ctx.execution.failed);
        assert!(!ctx.execution.skipped);
        assert_eq!(ctx.execution.error.as_deref(), Some("boom"));
    }

    #[test]
    fn next_reports_remaining() {
        let job = CountingJob::new(false);
        let mws: Vec<Arc<dyn Middleware>> = vec![Arc::new(ShortCircuit), Arc::new(Retry)];
        let next = Next::new(&mws, &job);
        assert_eq!(next.remaining(), 2);
    }
}
