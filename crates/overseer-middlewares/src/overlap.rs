use std::sync::Arc;

use async_trait::async_trait;
use overseer_core::config::OverlapConfig;
use overseer_scheduler::{Context, JobError, Middleware, Next};

/// Keeps the job's running counter up to date and, with `no_overlap`, skips
/// a run while another run of the same job is in flight.
///
/// The check and the increment are one compare-and-swap, so two triggers
/// firing together cannot both get through.
#[derive(Debug, Clone, Default)]
pub struct Overlap {
    no_overlap: bool,
}

impl Overlap {
    pub fn new(config: &OverlapConfig) -> Self {
        Self {
            no_overlap: config.no_overlap,
        }
    }
}

#[async_trait]
impl Middleware for Overlap {
    async fn run(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), JobError> {
        let job = Arc::clone(&ctx.job);

        let _running = if self.no_overlap {
            match job.bare().try_enter_exclusive() {
                Some(guard) => guard,
                None => {
                    ctx.execution.mark_skipped();
                    ctx.warn(format!(
                        "Skipping execution: {} run(s) still in progress",
                        job.running()
                    ));
                    return Ok(());
                }
            }
        } else {
            job.bare().enter()
        };

        next.run(ctx).await
    }

    fn name(&self) -> &str {
        "overlap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_scheduler::{BareJob, Job, Scheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Slow {
        bare: BareJob,
        calls: AtomicUsize,
        peak: AtomicUsize,
        started: Notify,
    }

    impl Slow {
        fn new(no_overlap: bool) -> Arc<Self> {
            let job = Arc::new(Self {
                bare: BareJob::new("slow", "@every 1h", "sleep"),
                calls: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Notify::new(),
            });
            job.use_middlewares(vec![
                Arc::new(Overlap::new(&OverlapConfig { no_overlap })) as Arc<dyn Middleware>
            ]);
            job
        }
    }

    #[async_trait]
    impl Job for Slow {
        fn bare(&self) -> &BareJob {
            &self.bare
        }

        async fn run(&self, _ctx: &mut Context) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.peak.fetch_max(self.running(), Ordering::SeqCst);
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skips_while_running() {
        let sh = Scheduler::new();
        let job = Slow::new(true);
        sh.add_job(job.clone()).unwrap();

        let first = tokio::spawn({
            let (sh, job) = (sh.clone(), job.clone());
            async move { sh.run_job(job).await }
        });
        job.started.notified().await;
        assert_eq!(job.running(), 1);

        let second = sh.run_job(job.clone()).await;
        assert!(second.skipped);
        assert!(!second.failed);

        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
        assert_eq!(job.peak.load(Ordering::SeqCst), 1);
        assert_eq!(job.running(), 0);
        assert_eq!(job.history().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn allows_overlap_when_permitted() {
        let sh = Scheduler::new();
        let job = Slow::new(false);
        sh.add_job(job.clone()).unwrap();

        let first = tokio::spawn({
            let (sh, job) = (sh.clone(), job.clone());
            async move { sh.run_job(job).await }
        });
        job.started.notified().await;

        let second = sh.run_job(job.clone()).await;
        assert!(!second.skipped);

        first.await.unwrap();
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.peak.load(Ordering::SeqCst), 2);
        assert_eq!(job.running(), 0);
    }

    #[tokio::test]
    async fn counter_released_on_error() {
        struct Failing {
            bare: BareJob,
        }

        #[async_trait]
        impl Job for Failing {
            fn bare(&self) -> &BareJob {
                &self.bare
            }

            async fn run(&self, _ctx: &mut Context) -> Result<(), JobError> {
                Err(JobError::failed("nope"))
            }
        }

        let sh = Scheduler::new();
        let job = Arc::new(Failing {
            bare: BareJob::new("failing", "@every 1h", "false"),
        });
        job.use_middlewares(vec![
            Arc::new(Overlap::new(&OverlapConfig { no_overlap: true })) as Arc<dyn Middleware>
        ]);
        sh.add_job(job.clone()).unwrap();

        let exec = sh.run_job(job.clone()).await;
        assert!(exec.failed);
        assert_eq!(job.running(), 0);

        // The next run is not mistaken for an overlap.
        let exec = sh.run_job(job.clone()).await;
        assert!(!exec.skipped);
    }
}
