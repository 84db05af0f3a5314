use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {path}")]
    ConfigNotFound { path: String },
}

impl CoreError {
    /// Short error code string, stable across releases, for log filtering.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::ConfigNotFound { .. } => "CONFIG_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
