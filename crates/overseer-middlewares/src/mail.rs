use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use overseer_core::config::MailConfig;
use overseer_scheduler::{Context, JobError, Middleware, Next};
use tracing::debug;

use crate::error::Result;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
const IMPLICIT_TLS_PORT: u16 = 465;

/// Mails a summary of each finished run, with its output attached.
#[derive(Debug, Clone)]
pub struct Mail {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    skip_verify: bool,
    to: Vec<String>,
    from: String,
    only_on_error: bool,
}

impl Mail {
    /// `None` unless both an SMTP host and at least one recipient are set.
    pub fn new(config: &MailConfig) -> Option<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())?
            .to_string();
        let to: Vec<String> = config
            .email_to
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if to.is_empty() {
            return None;
        }

        let from = config
            .email_from
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map_or_else(|| format!("overseer@{host}"), str::to_string);
        let credentials = match (&config.smtp_user, &config.smtp_password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Some((user.clone(), password.clone()))
            }
            _ => None,
        };

        Some(Self {
            host,
            port: config.smtp_port,
            credentials,
            skip_verify: config.smtp_tls_skip_verify,
            to,
            from,
            only_on_error: config.mail_only_on_error,
        })
    }

    /// Full message for the run held by `ctx`.
    pub fn build_message(&self, ctx: &Context) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.parse::<Mailbox>()?)
            .subject(subject(ctx));
        for to in &self.to {
            builder = builder.to(to.parse::<Mailbox>()?);
        }

        let exec = &ctx.execution;
        let mut body = MultiPart::mixed().singlepart(SinglePart::plain(summary(ctx)));
        if !exec.output.is_empty() {
            body = body.singlepart(
                Attachment::new("stdout.log".to_string())
                    .body(exec.output.as_str().to_string(), ContentType::TEXT_PLAIN),
            );
        }
        if !exec.error_output.is_empty() {
            body = body.singlepart(
                Attachment::new("stderr.log".to_string())
                    .body(exec.error_output.as_str().to_string(), ContentType::TEXT_PLAIN),
            );
        }
        body = body.singlepart(
            Attachment::new("execution.json".to_string())
                .body(serde_json::to_string_pretty(exec)?, ContentType::TEXT_PLAIN),
        );

        Ok(builder.multipart(body)?)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let params = TlsParameters::builder(self.host.clone())
            .dangerous_accept_invalid_certs(self.skip_verify)
            .build()?;
        let tls = if self.port == IMPLICIT_TLS_PORT {
            Tls::Wrapper(params)
        } else {
            Tls::Opportunistic(params)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
            .port(self.port)
            .tls(tls)
            .timeout(Some(SMTP_TIMEOUT));
        if let Some((user, password)) = &self.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(builder.build())
    }

    async fn send(&self, ctx: &Context) -> Result<()> {
        let message = self.build_message(ctx)?;
        self.transport()?.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for Mail {
    async fn run(&self, ctx: &mut Context, next: Next<'_>) -> std::result::Result<(), JobError> {
        let result = next.run(ctx).await;
        ctx.stop(result.as_ref().err());

        if !self.only_on_error || ctx.execution.failed {
            match self.send(ctx).await {
                Ok(()) => debug!(job = %ctx.job.name(), to = ?self.to, "mail sent"),
                Err(e) => ctx.warn(format!("Mail notification failed: {e}")),
            }
        }

        result
    }

    fn name(&self) -> &str {
        "mail"
    }
}

fn status(ctx: &Context) -> &'static str {
    let exec = &ctx.execution;
    if exec.failed {
        "failed"
    } else if exec.skipped {
        "skipped"
    } else {
        "successful"
    }
}

fn subject(ctx: &Context) -> String {
    format!(
        "[Execution {}] Job {:?} finished in {:?}",
        status(ctx),
        ctx.job.name(),
        ctx.execution.duration
    )
}

fn summary(ctx: &Context) -> String {
    let exec = &ctx.execution;
    let mut text = format!(
        "Job: {}\nCommand: {}\nSchedule: {}\nExecution: {}\nStatus: {}\nDuration: {:?}\n",
        ctx.job.name(),
        ctx.job.command(),
        ctx.job.schedule(),
        exec.id,
        status(ctx),
        exec.duration,
    );
    if let Some(error) = &exec.error {
        text.push_str(&format!("Error: {error}\n"));
    }
    text
}
