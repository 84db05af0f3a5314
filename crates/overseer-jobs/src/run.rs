use std::time::Duration;

use async_trait::async_trait;
use overseer_core::config::{RunJobConfig, DEFAULT_MAX_RUNTIME_SECS};
use overseer_scheduler::{BareJob, Context, Job, JobError, OutputBuffer};

use crate::process::Process;
use crate::{command_args, DOCKER_BIN};

/// Bound on `docker pull`, separate from the job's own runtime.
const PULL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Bound on the `docker rm -f` / `docker kill` issued after a timeout.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Starts a fresh container from `image` for every run, or restarts an
/// existing `container`.
pub struct RunJob {
    bare: BareJob,
    image: String,
    container: Option<String>,
    user: String,
    network: Option<String>,
    volumes: Vec<String>,
    environment: Vec<String>,
    tty: bool,
    delete: bool,
    pull: bool,
    max_runtime: Duration,
}

impl RunJob {
    pub fn new(name: impl Into<String>, config: &RunJobConfig) -> Self {
        Self {
            bare: BareJob::new(name, config.schedule.as_str(), config.command.as_str())
                .with_run_on_start(config.run_on_start),
            image: config.image.clone(),
            container: config.container.clone().filter(|c| !c.trim().is_empty()),
            user: config.user.clone(),
            network: config.network.clone().filter(|n| !n.is_empty()),
            volumes: config.volume.clone(),
            environment: config.environment.clone(),
            tty: config.tty,
            delete: config.delete,
            pull: config.pull,
            max_runtime: Duration::from_secs(
                config.max_runtime_secs.unwrap_or(DEFAULT_MAX_RUNTIME_SECS),
            ),
        }
    }

    /// Arguments for `docker run`, naming the container `container_name`.
    ///
    /// The command is split shell-style and passed as the container's argv, so
    /// the image's entrypoint receives it unchanged. Without a command the
    /// image's default runs.
    pub fn run_args(&self, container_name: &str) -> Result<Vec<String>, JobError> {
        let mut args = vec!["run".to_string(), "--name".into(), container_name.into()];
        if self.delete {
            args.push("--rm".into());
        }
        if self.tty {
            args.push("-t".into());
        }
        if !self.user.is_empty() {
            args.extend(["-u".into(), self.user.clone()]);
        }
        if let Some(network) = &self.network {
            args.extend(["--network".into(), network.clone()]);
        }
        for volume in &self.volumes {
            args.extend(["-v".into(), volume.clone()]);
        }
        for env in &self.environment {
            args.extend(["-e".into(), env.clone()]);
        }
        args.push(self.image.clone());
        args.extend(command_args(self.command())?);
        Ok(args)
    }

    /// Arguments to start an existing container with its output attached.
    pub fn start_args(container: &str) -> Vec<String> {
        vec!["start".into(), "-a".into(), container.into()]
    }

    /// Per-run container name, unique across runs of every job.
    pub fn container_name(&self, ctx: &Context) -> String {
        let job: String = self
            .name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
            .collect();
        format!("overseer-{job}-{}", ctx.execution.id.simple())
    }

    /// Refresh the image. A failed pull falls back to whatever image is
    /// already present locally; `docker run` pulls a missing image itself.
    async fn pull_image(&self, ctx: &Context) {
        let pull = Process::new(DOCKER_BIN, PULL_TIMEOUT).args(["pull", self.image.as_str()]);
        let mut out = OutputBuffer::default();
        let mut err = OutputBuffer::default();
        match pull.run(&mut out, &mut err).await {
            Ok(()) => ctx.log(format!("Pulled image {}", self.image)),
            Err(e) => ctx.warn(format!(
                "Pull of {} failed, using local image: {e}: {}",
                self.image,
                err.as_str().trim()
            )),
        }
    }

    /// The docker invocation for this run, with its timeout cleanup.
    fn process(&self, ctx: &Context) -> Result<Process, JobError> {
        if let Some(container) = &self.container {
            return Ok(Process::new(DOCKER_BIN, self.max_runtime)
                .args(Self::start_args(container))
                .on_timeout(
                    Process::new(DOCKER_BIN, CLEANUP_TIMEOUT).args(["kill", container.as_str()]),
                ));
        }

        if self.image.trim().is_empty() {
            return Err(JobError::failed("job-run needs an image or a container"));
        }

        let name = self.container_name(ctx);
        let args = self.run_args(&name)?;
        Ok(Process::new(DOCKER_BIN, self.max_runtime)
            .args(args)
            .on_timeout(Process::new(DOCKER_BIN, CLEANUP_TIMEOUT).args(["rm", "-f", name.as_str()])))
    }
}

#[async_trait]
impl Job for RunJob {
    fn bare(&self) -> &BareJob {
        &self.bare
    }

    async fn run(&self, ctx: &mut Context) -> Result<(), JobError> {
        let process = self.process(ctx)?;
        if self.pull && self.container.is_none() {
            self.pull_image(ctx).await;
        }

        let exec = &mut ctx.execution;
        process.run(&mut exec.output, &mut exec.error_output).await
    }
}
