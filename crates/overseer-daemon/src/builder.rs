//! Turns a loaded [`OverseerConfig`] into a ready-to-start [`Scheduler`].

use std::sync::Arc;

use anyhow::Context as _;
use overseer_core::config::{GlobalConfig, JobMiddlewareConfig, OverseerConfig};
use overseer_jobs::{ExecJob, LocalJob, RunJob};
use overseer_middlewares::{Mail, Overlap, Save, Slack};
use overseer_scheduler::{Job, Middleware, Scheduler};

/// Build the scheduler with every configured job registered.
///
/// Jobs are added kind by kind (local, run, exec), each kind in name order.
pub fn build_scheduler(config: &OverseerConfig) -> anyhow::Result<Scheduler> {
    let scheduler = Scheduler::new();
    scheduler.use_middlewares(global_middlewares(&config.global));

    for (name, cfg) in &config.local_jobs {
        let job = LocalJob::new(name.as_str(), cfg);
        register(&scheduler, "job-local", job, &cfg.middlewares)?;
    }
    for (name, cfg) in &config.run_jobs {
        let job = RunJob::new(name.as_str(), cfg);
        register(&scheduler, "job-run", job, &cfg.middlewares)?;
    }
    for (name, cfg) in &config.exec_jobs {
        let job = ExecJob::new(name.as_str(), cfg);
        register(&scheduler, "job-exec", job, &cfg.middlewares)?;
    }

    Ok(scheduler)
}

fn register<J: Job + 'static>(
    scheduler: &Scheduler,
    section: &str,
    job: J,
    middlewares: &JobMiddlewareConfig,
) -> anyhow::Result<()> {
    job.use_middlewares(job_middlewares(middlewares));
    let name = job.name().to_string();
    scheduler
        .add_job(Arc::new(job))
        .with_context(|| format!("[{section}.{name}]"))
}

fn global_middlewares(config: &GlobalConfig) -> Vec<Arc<dyn Middleware>> {
    let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
    if let Some(save) = Save::new(&config.save) {
        chain.push(Arc::new(save));
    }
    if let Some(slack) = Slack::new(&config.slack) {
        chain.push(Arc::new(slack));
    }
    if let Some(mail) = Mail::new(&config.mail) {
        chain.push(Arc::new(mail));
    }
    chain
}

fn job_middlewares(config: &JobMiddlewareConfig) -> Vec<Arc<dyn Middleware>> {
    let mut chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Overlap::new(&config.overlap))];
    if let Some(save) = Save::new(&config.save) {
        chain.push(Arc::new(save));
    }
    if let Some(slack) = Slack::new(&config.slack) {
        chain.push(Arc::new(slack));
    }
    if let Some(mail) = Mail::new(&config.mail) {
        chain.push(Arc::new(mail));
    }
    chain
}
