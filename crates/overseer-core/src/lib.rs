//! `overseer-core`: configuration model and shared error type for Overseer.

pub mod config;
pub mod error;

pub use config::OverseerConfig;
pub use error::{CoreError, Result};
