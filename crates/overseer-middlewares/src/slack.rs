use async_trait::async_trait;
use overseer_core::config::SlackConfig;
use overseer_scheduler::{Context, JobError, Middleware, Next};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;

const USERNAME: &str = "Overseer";

const COLOR_FAILED: &str = "#F35A00";
const COLOR_SKIPPED: &str = "#FFA500";
const COLOR_SUCCESS: &str = "#7CD197";

/// Posts a summary of each finished run to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct Slack {
    webhook: String,
    only_on_error: bool,
    client: reqwest::Client,
}

impl Slack {
    /// `None` when no webhook URL is configured.
    pub fn new(config: &SlackConfig) -> Option<Self> {
        let webhook = config
            .slack_webhook
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())?
            .to_string();
        Some(Self {
            webhook,
            only_on_error: config.slack_only_on_error,
            client: reqwest::Client::new(),
        })
    }

    async fn push(&self, message: &Value) -> Result<()> {
        self.client
            .post(&self.webhook)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for Slack {
    async fn run(&self, ctx: &mut Context, next: Next<'_>) -> std::result::Result<(), JobError> {
        let result = next.run(ctx).await;
        ctx.stop(result.as_ref().err());

        if !self.only_on_error || ctx.execution.failed {
            let message = build_message(ctx);
            match self.push(&message).await {
                Ok(()) => debug!(job = %ctx.job.name(), "slack notification sent"),
                Err(e) => ctx.warn(format!("Slack notification failed: {e}")),
            }
        }

        result
    }

    fn name(&self) -> &str {
        "slack"
    }
}

/// Webhook payload for the run held by `ctx`.
pub fn build_message(ctx: &Context) -> Value {
    let exec = &ctx.execution;
    let text = format!(
        "Job *{:?}* finished in *{:?}*, command `{}`",
        ctx.job.name(),
        exec.duration,
        ctx.job.command()
    );

    let attachment = if exec.failed {
        json!({
            "title": "Execution failed",
            "text": exec.error.as_deref().unwrap_or_default(),
            "color": COLOR_FAILED,
        })
    } else if exec.skipped {
        json!({
            "title": "Execution skipped",
            "color": COLOR_SKIPPED,
        })
    } else {
        json!({
            "title": "Execution successful",
            "color": COLOR_SUCCESS,
        })
    };

    json!({
        "username": USERNAME,
        "text": text,
        "attachments": [attachment],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_scheduler::{BareJob, Execution, Job, Scheduler};
    use std::sync::Arc;

    struct Body {
        bare: BareJob,
        fail: bool,
    }

    #[async_trait]
    impl Job for Body {
        fn bare(&self) -> &BareJob {
            &self.bare
        }

        async fn run(&self, _ctx: &mut Context) -> std::result::Result<(), JobError> {
            if self.fail {
                Err(JobError::NonZeroExit { code: 1 })
            } else {
                Ok(())
            }
        }
    }

    fn context_for(fail: bool) -> Context {
        let job: Arc<dyn Job> = Arc::new(Body {
            bare: BareJob::new("backup", "@daily", "tar czf /tmp/b.tgz /data"),
            fail,
        });
        Context::new(Scheduler::new(), job, Execution::new())
    }

    #[test]
    fn disabled_without_webhook() {
        assert!(Slack::new(&SlackConfig::default()).is_none());
        let blank = SlackConfig {
            slack_webhook: Some("  ".into()),
            slack_only_on_error: false,
        };
        assert!(Slack::new(&blank).is_none());
    }

    #[test]
    fn message_for_success() {
        let mut ctx = context_for(false);
        ctx.start();
        ctx.stop(None);

        let msg = build_message(&ctx);
        let text = msg["text"].as_str().unwrap();
        assert!(text.starts_with("Job *\"backup\"* finished in *"));
        assert!(text.ends_with("command `tar czf /tmp/b.tgz /data`"));
        assert_eq!(msg["attachments"][0]["title"], "Execution successful");
        assert_eq!(msg["attachments"][0]["color"], COLOR_SUCCESS);
    }

    #[test]
    fn message_for_failure_carries_error() {
        let mut ctx = context_for(true);
        ctx.start();
        ctx.stop(Some(&JobError::NonZeroExit { code: 1 }));

        let msg = build_message(&ctx);
        assert_eq!(msg["attachments"][0]["title"], "Execution failed");
        assert_eq!(msg["attachments"][0]["color"], COLOR_FAILED);
        assert_eq!(
            msg["attachments"][0]["text"],
            "error non-zero exit code: 1"
        );
    }

    #[test]
    fn message_for_skip() {
        let mut ctx = context_for(false);
        ctx.start();
        ctx.execution.mark_skipped();
        ctx.stop(None);

        let msg = build_message(&ctx);
        assert_eq!(msg["attachments"][0]["title"], "Execution skipped");
        assert_eq!(msg["attachments"][0]["color"], COLOR_SKIPPED);
    }

    #[tokio::test]
    async fn unreachable_webhook_keeps_outcome() {
        let config = SlackConfig {
            slack_webhook: Some("http://127.0.0.1:1/hook".into()),
            slack_only_on_error: false,
        };
        let slack = Slack::new(&config).unwrap();

        let sh = Scheduler::new();
        for fail in [false, true] {
            let job = Arc::new(Body {
                bare: BareJob::new(format!("job-{fail}"), "@hourly", "true"),
                fail,
            });
            job.use_middlewares(vec![Arc::new(slack.clone()) as Arc<dyn Middleware>]);
            sh.add_job(job.clone()).unwrap();

            let exec = sh.run_job(job).await;
            assert_eq!(exec.failed, fail);
        }
    }
}
