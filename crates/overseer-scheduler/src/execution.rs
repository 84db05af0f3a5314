//! Record of a single job run.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::JobError;

/// Maximum bytes kept per output stream (1 MiB). Oldest data is discarded first.
pub const OUTPUT_BUF_MAX: usize = 1_048_576;

/// Bounded accumulator for a run's stdout or stderr.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    buf: String,
    max: usize,
    discarded: usize,
}

impl OutputBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            buf: String::new(),
            max,
            discarded: 0,
        }
    }

    pub fn push_str(&mut self, text: &str) {
        self.buf.push_str(text);

        if self.buf.len() > self.max {
            let mut cut = self.buf.len() - self.max;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
            self.discarded += cut;
        }
    }

    /// Append raw process output, replacing invalid UTF-8.
    pub fn push_bytes(&mut self, raw: &[u8]) {
        self.push_str(&String::from_utf8_lossy(raw));
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of bytes dropped from the head because the buffer overflowed.
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(OUTPUT_BUF_MAX)
    }
}

impl fmt::Display for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

impl Serialize for OutputBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.buf)
    }
}

/// Lifecycle position of an [`Execution`].
///
/// `Created → Running → (Skipped | Succeeded | Failed)`. The last three are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Running,
    Skipped,
    Succeeded,
    Failed,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Created => "created",
            ExecutionState::Running => "running",
            ExecutionState::Skipped => "skipped",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One run of one job.
///
/// Created fresh by the wrapper, mutated while the chain runs, then frozen
/// behind an `Arc` in the job's history.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: Uuid,
    /// Wall-clock start, set by [`Execution::start`].
    pub date: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub is_running: bool,
    pub failed: bool,
    /// Set only by a middleware that chose not to run the job.
    pub skipped: bool,
    pub error: Option<String>,
    #[serde(skip)]
    pub output: OutputBuffer,
    #[serde(skip)]
    pub error_output: OutputBuffer,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl Execution {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            date: None,
            finished_at: None,
            duration: Duration::ZERO,
            is_running: false,
            failed: false,
            skipped: false,
            error: None,
            output: OutputBuffer::default(),
            error_output: OutputBuffer::default(),
            started_at: None,
        }
    }

    pub fn start(&mut self) {
        self.is_running = true;
        self.date = Some(Utc::now());
        self.started_at = Some(Instant::now());
    }

    /// Record the end of the run. May be called again; the latest call wins.
    ///
    /// `skipped` is left exactly as middlewares set it.
    pub fn stop(&mut self, err: Option<&JobError>) {
        self.is_running = false;
        self.finished_at = Some(Utc::now());
        self.duration = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.failed = err.is_some();
        self.error = err.map(ToString::to_string);
    }

    pub fn mark_skipped(&mut self) {
        self.skipped = true;
    }

    pub fn state(&self) -> ExecutionState {
        if self.date.is_none() {
            ExecutionState::Created
        } else if self.skipped {
            ExecutionState::Skipped
        } else if self.is_running {
            ExecutionState::Running
        } else if self.failed {
            ExecutionState::Failed
        } else {
            ExecutionState::Succeeded
        }
    }
}

impl Default for Execution {
    fn default() -> Self {
        Self::new()
    }
}
