use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/overseer.toml";
pub const ENV_PREFIX: &str = "OVERSEER_";
/// Jobs killed after running this long unless configured otherwise (24h).
pub const DEFAULT_MAX_RUNTIME_SECS: u64 = 24 * 60 * 60;

/// Top-level config (overseer.toml + OVERSEER_* env overrides).
///
/// Nested keys are addressed with a double underscore in the environment,
/// e.g. `OVERSEER_GLOBAL__SLACK_WEBHOOK`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverseerConfig {
    /// Middlewares applied to every job, after the job's own.
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default, rename = "job-local")]
    pub local_jobs: BTreeMap<String, LocalJobConfig>,
    #[serde(default, rename = "job-run")]
    pub run_jobs: BTreeMap<String, RunJobConfig>,
    #[serde(default, rename = "job-exec")]
    pub exec_jobs: BTreeMap<String, ExecJobConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(flatten)]
    pub save: SaveConfig,
    #[serde(flatten)]
    pub slack: SlackConfig,
    #[serde(flatten)]
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlapConfig {
    /// Skip a run while a previous run of the same job is still in flight.
    #[serde(default)]
    pub no_overlap: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveConfig {
    /// Directory receiving one metadata + two log files per run.
    pub save_folder: Option<PathBuf>,
    #[serde(default)]
    pub save_only_on_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlackConfig {
    /// Incoming-webhook URL.
    pub slack_webhook: Option<String>,
    #[serde(default)]
    pub slack_only_on_error: bool,
}

/// SMTP notifier. Enabled once `smtp_host` and `email_to` are both set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailConfig {
    pub smtp_host: Option<String>,
    /// 465 means implicit TLS; any other port upgrades with STARTTLS when offered.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls_skip_verify: bool,
    /// Comma separated recipients.
    pub email_to: Option<String>,
    /// Defaults to `overseer@<smtp_host>`.
    pub email_from: Option<String>,
    #[serde(default)]
    pub mail_only_on_error: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_user: None,
            smtp_password: None,
            smtp_tls_skip_verify: false,
            email_to: None,
            email_from: None,
            mail_only_on_error: false,
        }
    }
}

/// Per-job middleware settings shared by every job section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMiddlewareConfig {
    #[serde(flatten)]
    pub overlap: OverlapConfig,
    #[serde(flatten)]
    pub save: SaveConfig,
    #[serde(flatten)]
    pub slack: SlackConfig,
    #[serde(flatten)]
    pub mail: MailConfig,
}

/// `[job-local.<name>]`: a command run by the local shell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalJobConfig {
    #[serde(default)]
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub run_on_start: bool,
    /// Working directory; inherits the daemon's when unset.
    pub dir: Option<PathBuf>,
    /// Extra `KEY=value` pairs added to the inherited environment.
    #[serde(default)]
    pub environment: Vec<String>,
    pub max_runtime_secs: Option<u64>,
    #[serde(flatten)]
    pub middlewares: JobMiddlewareConfig,
}

/// `[job-run.<name>]`: a fresh container started from `image`, or an existing
/// stopped `container` started again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobConfig {
    #[serde(default)]
    pub schedule: String,
    /// Overrides the image's default command when non-empty.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub run_on_start: bool,
    #[serde(default)]
    pub image: String,
    /// Existing container to start instead of creating one. Wins over `image`.
    pub container: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    pub network: Option<String>,
    /// Bind mounts in `host:container[:mode]` form.
    #[serde(default)]
    pub volume: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    /// Remove the container once it exits.
    #[serde(default = "bool_true")]
    pub delete: bool,
    /// Pull the image before every run.
    #[serde(default = "bool_true")]
    pub pull: bool,
    pub max_runtime_secs: Option<u64>,
    #[serde(flatten)]
    pub middlewares: JobMiddlewareConfig,
}

/// `[job-exec.<name>]`: a command run inside an already running container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecJobConfig {
    #[serde(default)]
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub run_on_start: bool,
    pub container: String,
    pub user: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub environment: Vec<String>,
    pub max_runtime_secs: Option<u64>,
    #[serde(flatten)]
    pub middlewares: JobMiddlewareConfig,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn bool_true() -> bool {
    true
}

impl OverseerConfig {
    /// Load config from a TOML file with OVERSEER_* env var overrides.
    ///
    /// Falls back to [`DEFAULT_CONFIG_PATH`] when no path is given. A missing
    /// file is an error: an empty config would only fail later at start.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        if !Path::new(path).exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.to_string(),
            });
        }

        tracing::debug!(path, "loading config");
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Parse config from an in-memory TOML document (env overrides still apply).
    pub fn from_toml_str(config: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(config)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Total number of job sections across all kinds.
    pub fn job_count(&self) -> usize {
        self.local_jobs.len() + self.run_jobs.len() + self.exec_jobs.len()
    }
}
