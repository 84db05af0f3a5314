use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use overseer_core::config::{LocalJobConfig, DEFAULT_MAX_RUNTIME_SECS};
use overseer_scheduler::{BareJob, Context, Job, JobError};

use crate::process::Process;

/// Runs its command through the host shell.
pub struct LocalJob {
    bare: BareJob,
    dir: Option<PathBuf>,
    environment: Vec<String>,
    max_runtime: Duration,
}

impl LocalJob {
    pub fn new(name: impl Into<String>, config: &LocalJobConfig) -> Self {
        Self {
            bare: BareJob::new(name, config.schedule.as_str(), config.command.as_str())
                .with_run_on_start(config.run_on_start),
            dir: config.dir.clone(),
            environment: config.environment.clone(),
            max_runtime: Duration::from_secs(
                config.max_runtime_secs.unwrap_or(DEFAULT_MAX_RUNTIME_SECS),
            ),
        }
    }

    pub fn process(&self) -> Process {
        Process::new("sh", self.max_runtime)
            .arg("-c")
            .arg(self.command())
            .current_dir(self.dir.clone())
            .envs(&self.environment)
    }
}

#[async_trait]
impl Job for LocalJob {
    fn bare(&self) -> &BareJob {
        &self.bare
    }

    async fn run(&self, ctx: &mut Context) -> Result<(), JobError> {
        let exec = &mut ctx.execution;
        self.process()
            .run(&mut exec.output, &mut exec.error_output)
            .await
    }
}
