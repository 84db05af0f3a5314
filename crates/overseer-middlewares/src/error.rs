use thiserror::Error;

/// Failures inside a middleware's own side effect. Logged by the middleware,
/// never turned into a run failure.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Mail build failed: {0}")]
    Email(#[from] lettre::error::Error),
}

pub type Result<T> = std::result::Result<T, MiddlewareError>;
