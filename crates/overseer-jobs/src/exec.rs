use std::time::Duration;

use async_trait::async_trait;
use overseer_core::config::{ExecJobConfig, DEFAULT_MAX_RUNTIME_SECS};
use overseer_scheduler::{BareJob, Context, Job, JobError};

use crate::process::Process;
use crate::{command_args, DOCKER_BIN};

/// Runs its command inside an already running container.
///
/// On timeout the local `docker exec` client is killed; the daemon does not
/// offer a way to kill the exec'd process itself.
pub struct ExecJob {
    bare: BareJob,
    container: String,
    user: Option<String>,
    tty: bool,
    environment: Vec<String>,
    max_runtime: Duration,
}

impl ExecJob {
    pub fn new(name: impl Into<String>, config: &ExecJobConfig) -> Self {
        Self {
            bare: BareJob::new(name, config.schedule.as_str(), config.command.as_str())
                .with_run_on_start(config.run_on_start),
            container: config.container.clone(),
            user: config.user.clone().filter(|u| !u.is_empty()),
            tty: config.tty,
            environment: config.environment.clone(),
            max_runtime: Duration::from_secs(
                config.max_runtime_secs.unwrap_or(DEFAULT_MAX_RUNTIME_SECS),
            ),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Arguments for `docker exec`. The command is split shell-style into the
    /// exec'd argv.
    pub fn exec_args(&self) -> Result<Vec<String>, JobError> {
        let mut args = vec!["exec".to_string()];
        if self.tty {
            args.push("-t".into());
        }
        if let Some(user) = &self.user {
            args.extend(["-u".into(), user.clone()]);
        }
        for env in &self.environment {
            args.extend(["-e".into(), env.clone()]);
        }
        args.push(self.container.clone());
        args.extend(command_args(self.command())?);
        Ok(args)
    }
}

#[async_trait]
impl Job for ExecJob {
    fn bare(&self) -> &BareJob {
        &self.bare
    }

    async fn run(&self, ctx: &mut Context) -> Result<(), JobError> {
        let exec = &mut ctx.execution;
        Process::new(DOCKER_BIN, self.max_runtime)
            .args(self.exec_args()?)
            .run(&mut exec.output, &mut exec.error_output)
            .await
    }
}
