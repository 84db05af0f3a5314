//! `overseer-scheduler`: cron-driven job execution engine.
//!
//! # Overview
//!
//! A [`Scheduler`] owns a registry of [`Job`]s and a [`CronEngine`] that fires
//! each job's schedule on its own Tokio task. Every fire is adapted by a
//! [`JobWrapper`] into one [`Execution`] plus one [`Context`], and the context
//! drives the job's [`Middleware`] chain before reaching the job body.
//!
//! ```text
//! CronEngine ──fire──▶ JobWrapper ──▶ Context::next()
//!                                        │
//!                        mw[0] ─▶ mw[1] ─▶ … ─▶ Job::run
//! ```
//!
//! # Schedule syntax
//!
//! | Form                     | Example             |
//! |--------------------------|---------------------|
//! | 5-field cron             | `*/5 * * * *`       |
//! | 6/7-field cron (seconds) | `0 30 2 * * Mon-Fri`|
//! | Descriptor               | `@daily`, `@hourly` |
//! | Interval                 | `@every 1h30m`      |

pub mod context;
pub mod error;
pub mod execution;
pub mod job;
pub mod scheduler;
pub mod trigger;
pub mod wrapper;

pub use context::{Context, Middleware, Next};
pub use error::{JobError, Result, SchedulerError};
pub use execution::{Execution, ExecutionState, OutputBuffer};
pub use job::{BareJob, Job, RunningGuard};
pub use scheduler::Scheduler;
pub use trigger::{CronEngine, EntryId, EntryInfo, Schedule};
pub use wrapper::JobWrapper;
