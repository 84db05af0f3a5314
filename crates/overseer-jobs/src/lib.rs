//! Concrete job kinds.
//!
//! Every kind ends up in [`process::Process`], which spawns a child, streams
//! its stdout/stderr into the run's [`Execution`] buffers and enforces the
//! job's maximum runtime.
//!
//! | Kind         | Config section      | Runs                                      |
//! |--------------|---------------------|-------------------------------------------|
//! | [`LocalJob`] | `[job-local.<name>]`| `sh -c <command>` on the host             |
//! | [`RunJob`]   | `[job-run.<name>]`  | `docker run <image> <argv>` or `docker start -a <container>` |
//! | [`ExecJob`]  | `[job-exec.<name>]` | `docker exec <container> <argv>`          |
//!
//! Container commands are split shell-style into an argv; no shell is
//! assumed inside the image.
//!
//! [`Execution`]: overseer_scheduler::Execution

pub mod exec;
pub mod local;
pub mod process;
pub mod run;

use overseer_scheduler::JobError;

pub use exec::ExecJob;
pub use local::LocalJob;
pub use process::Process;
pub use run::RunJob;

/// Container CLI used by [`RunJob`] and [`ExecJob`].
pub const DOCKER_BIN: &str = "docker";

/// Split `command` the way a POSIX shell would, without running one.
pub fn command_args(command: &str) -> Result<Vec<String>, JobError> {
    shell_words::split(command)
        .map_err(|e| JobError::failed(format!("invalid command {command:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_like_a_shell() {
        assert_eq!(
            command_args(r#"reindex --index "logs 2024" --force"#).unwrap(),
            ["reindex", "--index", "logs 2024", "--force"]
        );
        assert!(command_args("").unwrap().is_empty());
        assert!(command_args("echo \"unterminated").is_err());
    }
}
