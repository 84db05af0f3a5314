use std::path::{Path, PathBuf};

use async_trait::async_trait;
use overseer_core::config::SaveConfig;
use overseer_scheduler::{Context, Execution, JobError, Middleware, Next};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Writes each run to `<folder>/<YYYYmmdd_HHMMSS>_<job>.{json,stdout.log,stderr.log}`.
#[derive(Debug, Clone)]
pub struct Save {
    folder: PathBuf,
    only_on_error: bool,
}

/// On-disk shape of the `.json` file.
#[derive(Serialize)]
struct SavedRun<'a> {
    job: &'a str,
    command: &'a str,
    schedule: &'a str,
    execution: &'a Execution,
}

impl Save {
    /// `None` when no folder is configured.
    pub fn new(config: &SaveConfig) -> Option<Self> {
        let folder = config.save_folder.clone()?;
        Some(Self {
            folder,
            only_on_error: config.save_only_on_error,
        })
    }

    async fn save_to_disk(&self, ctx: &Context) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.folder).await?;

        let base = self.folder.join(format!(
            "{}_{}",
            file_stamp(&ctx.execution),
            file_safe(ctx.job.name())
        ));

        let record = SavedRun {
            job: ctx.job.name(),
            command: ctx.job.command(),
            schedule: ctx.job.schedule(),
            execution: &ctx.execution,
        };
        tokio::fs::write(with_suffix(&base, "json"), serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::write(
            with_suffix(&base, "stdout.log"),
            ctx.execution.output.as_str(),
        )
        .await?;
        tokio::fs::write(
            with_suffix(&base, "stderr.log"),
            ctx.execution.error_output.as_str(),
        )
        .await?;

        Ok(base)
    }
}

#[async_trait]
impl Middleware for Save {
    async fn run(&self, ctx: &mut Context, next: Next<'_>) -> std::result::Result<(), JobError> {
        let result = next.run(ctx).await;
        ctx.stop(result.as_ref().err());

        if !self.only_on_error || ctx.execution.failed {
            match self.save_to_disk(ctx).await {
                Ok(base) => debug!(job = %ctx.job.name(), path = %base.display(), "execution saved"),
                Err(e) => ctx.warn(format!("Failed to save execution: {e}")),
            }
        }

        result
    }

    fn name(&self) -> &str {
        "save"
    }
}

/// Local start time, matching the timezone schedules are evaluated in.
fn file_stamp(execution: &Execution) -> String {
    execution
        .date
        .unwrap_or_else(chrono::Utc::now)
        .with_timezone(&chrono::Local)
        .format("%Y%m%d_%H%M%S")
        .to_string()
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Job names become file names; keep them to a portable character set.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_scheduler::{BareJob, Job, Scheduler};
    use std::sync::Arc;

    struct Echo {
        bare: BareJob,
        fail: bool,
    }

    #[async_trait]
    impl Job for Echo {
        fn bare(&self) -> &BareJob {
            &self.bare
        }

        async fn run(&self, ctx: &mut Context) -> std::result::Result<(), JobError> {
            ctx.execution.output.push_str("hello\n");
            ctx.execution.error_output.push_str("warn\n");
            if self.fail {
                Err(JobError::NonZeroExit { code: 2 })
            } else {
                Ok(())
            }
        }
    }

    fn job_with_save(name: &str, fail: bool, config: &SaveConfig) -> Arc<Echo> {
        let job = Arc::new(Echo {
            bare: BareJob::new(name, "@every 1h", "echo hello"),
            fail,
        });
        if let Some(save) = Save::new(config) {
            job.use_middlewares(vec![Arc::new(save) as Arc<dyn Middleware>]);
        }
        job
    }

    fn saved_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn disabled_without_folder() {
        assert!(Save::new(&SaveConfig::default()).is_none());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(file_safe("db backup/nightly"), "db_backup_nightly");
        assert_eq!(file_safe("ok-name_1.x"), "ok-name_1.x");
    }

    #[tokio::test]
    async fn writes_metadata_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let config = SaveConfig {
            save_folder: Some(dir.path().to_path_buf()),
            save_only_on_error: false,
        };
        let sh = Scheduler::new();
        let job = job_with_save("greeter", false, &config);
        sh.add_job(job.clone()).unwrap();

        sh.run_job(job.clone()).await;

        let exec = job.history().pop().unwrap();
        let stamp = exec
            .date
            .unwrap()
            .with_timezone(&chrono::Local)
            .format("%Y%m%d_%H%M%S")
            .to_string();

        let files = saved_files(dir.path());
        assert_eq!(files.len(), 3, "{files:?}");
        assert!(files.contains(&format!("{stamp}_greeter.json")), "{files:?}");

        let stdout = files.iter().find(|f| f.ends_with(".stdout.log")).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join(stdout)).unwrap(), "hello\n");

        let json = files.iter().find(|f| f.ends_with(".json")).unwrap();
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(json)).unwrap()).unwrap();
        assert_eq!(meta["job"], "greeter");
        assert_eq!(meta["execution"]["failed"], false);
        assert_eq!(meta["execution"]["is_running"], false);
    }

    #[tokio::test]
    async fn only_on_error_skips_successful_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SaveConfig {
            save_folder: Some(dir.path().to_path_buf()),
            save_only_on_error: true,
        };
        let sh = Scheduler::new();
        let ok = job_with_save("ok", false, &config);
        let bad = job_with_save("bad", true, &config);
        sh.add_job(ok.clone()).unwrap();
        sh.add_job(bad.clone()).unwrap();

        sh.run_job(ok).await;
        assert!(saved_files(dir.path()).is_empty());

        let exec = sh.run_job(bad).await;
        assert!(exec.failed);
        let files = saved_files(dir.path());
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.contains("_bad.")));
    }

    #[tokio::test]
    async fn write_failure_does_not_change_outcome() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the folder should be makes create_dir_all fail.
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let config = SaveConfig {
            save_folder: Some(blocker),
            save_only_on_error: false,
        };
        let sh = Scheduler::new();
        let job = job_with_save("blocked", false, &config);
        sh.add_job(job.clone()).unwrap();

        let exec = sh.run_job(job).await;
        assert!(!exec.failed);
        assert!(exec.error.is_none());
    }
}
