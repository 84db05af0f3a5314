use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use overseer_scheduler::{JobError, OutputBuffer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long pipe readers may keep going once the child has exited. A
/// backgrounded grandchild can hold the pipes open indefinitely.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Bytes kept per stream while reading; the execution buffer trims further.
const CAPTURE_LIMIT: usize = 2 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// A child process to run for one execution.
#[derive(Debug, Clone)]
pub struct Process {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    max_runtime: Duration,
    /// Run after a timed out child is killed, for work living outside the
    /// process tree (e.g. a container).
    on_timeout: Option<Box<Process>>,
}

impl Process {
    pub fn new(program: impl Into<String>, max_runtime: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
            max_runtime,
            on_timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dir = dir;
        self
    }

    /// Add `KEY=value` entries on top of the inherited environment.
    /// Entries without `=` are ignored with a warning.
    pub fn envs<'a>(mut self, entries: impl IntoIterator<Item = &'a String>) -> Self {
        for entry in entries {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    self.env.push((key.to_string(), value.to_string()));
                }
                _ => warn!(entry = %entry, "ignoring malformed environment entry"),
            }
        }
        self
    }

    pub fn on_timeout(mut self, cleanup: Process) -> Self {
        self.on_timeout = Some(Box::new(cleanup));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    pub fn timeout_cleanup(&self) -> Option<&Process> {
        self.on_timeout.as_deref()
    }

    /// Run to completion, appending the child's output to `stdout`/`stderr`.
    ///
    /// The child leads its own process group. On timeout the whole group is
    /// killed, then the `on_timeout` cleanup runs. Whatever was captured is
    /// kept even when the run fails or times out.
    pub async fn run(
        &self,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<(), JobError> {
        debug!(program = %self.program, args = ?self.args, "spawning process");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| JobError::Spawn(format!("{}: {e}", self.program)))?;

        let out_sink = Sink::default();
        let err_sink = Sink::default();
        let readers = [
            spawn_reader(child.stdout.take(), out_sink.clone()),
            spawn_reader(child.stderr.take(), err_sink.clone()),
        ];

        let status = match tokio::time::timeout(self.max_runtime, child.wait()).await {
            Ok(status) => Some(status),
            Err(_) => {
                warn!(program = %self.program, "maximum runtime exceeded, killing process group");
                kill_process_group(&mut child).await;
                if let Some(cleanup) = &self.on_timeout {
                    cleanup.run_cleanup().await;
                }
                None
            }
        };

        for reader in readers.into_iter().flatten() {
            finish_reader(reader).await;
        }
        stdout.push_bytes(&out_sink.take());
        stderr.push_bytes(&err_sink.take());

        match status {
            None => Err(JobError::MaxTimeRunning {
                secs: self.max_runtime.as_secs(),
            }),
            Some(status) => exit_result(status?),
        }
    }
}

impl Process {
    /// Best-effort run of a cleanup command; output is only logged.
    async fn run_cleanup(&self) {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.max_runtime, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(program = %self.program, args = ?self.args, "timeout cleanup done");
            }
            Ok(Ok(output)) => warn!(
                program = %self.program,
                args = ?self.args,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "timeout cleanup failed"
            ),
            Ok(Err(e)) => warn!(program = %self.program, error = %e, "timeout cleanup failed to start"),
            Err(_) => warn!(program = %self.program, "timeout cleanup timed out"),
        }
    }
}

/// SIGKILL the child's whole process group, then reap the child.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child called setpgid(0, 0), so its pid is the group id.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to kill process group");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill timed out process");
    }
}

fn exit_result(status: ExitStatus) -> Result<(), JobError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(JobError::NonZeroExit { code }),
        None => Err(JobError::Unexpected(format!("process terminated: {status}"))),
    }
}

/// Shared byte sink for one output stream.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn append(&self, bytes: &[u8]) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend_from_slice(bytes);
        if buf.len() > CAPTURE_LIMIT {
            let excess = buf.len() - CAPTURE_LIMIT;
            buf.drain(..excess);
        }
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn spawn_reader<R>(reader: Option<R>, sink: Sink) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.append(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    }))
}

async fn finish_reader(mut reader: JoinHandle<()>) {
    if tokio::time::timeout(PIPE_GRACE, &mut reader).await.is_err() {
        debug!("output pipe still open after exit, detaching reader");
        reader.abort();
    }
}
