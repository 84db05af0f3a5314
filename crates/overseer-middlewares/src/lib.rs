//! Middlewares wrapped around job runs.
//!
//! | Middleware  | Scope          | Effect                                           |
//! |-------------|----------------|--------------------------------------------------|
//! | [`Overlap`] | per job        | tracks in-flight runs, optionally skips overlaps |
//! | [`Save`]    | job or global  | writes run metadata and output to a folder       |
//! | [`Slack`]   | job or global  | posts a run summary to an incoming webhook       |
//! | [`Mail`]    | job or global  | mails a run summary with output attached         |
//!
//! `Save`, `Slack` and `Mail` constructors return `None` when their config leaves
//! them disabled, so builders can skip them.

pub mod error;
pub mod mail;
pub mod overlap;
pub mod save;
pub mod slack;

pub use error::{MiddlewareError, Result};
pub use mail::Mail;
pub use overlap::Overlap;
pub use save::Save;
pub use slack::Slack;
