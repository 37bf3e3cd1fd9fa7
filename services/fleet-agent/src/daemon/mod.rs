//! Command channel to a container daemon.
//!
//! Every daemon interaction is textual: a `docker` argument vector or a host
//! shell command, answered with an exit code and captured output. The
//! [`Daemon`] trait is the seam; [`ShellDaemon`] drives real processes and
//! [`MockDaemon`] emulates the command surface in memory.

mod cli;
mod mock;
mod shell;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetResult;

pub use cli::{image_ref, ContainerInfo, DockerCli, RunSpec, CONTAINER_INSPECT_FORMAT, ID_FORMAT};
pub use mock::{MockDaemon, MockDaemonSettings};
pub use shell::ShellDaemon;

/// Captured result of one daemon or shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A zero exit with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A non-zero exit with the given stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote command channel to one daemon endpoint.
#[async_trait]
pub trait Daemon: Send + Sync + fmt::Debug {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    /// Run `docker <args>` against this daemon.
    async fn docker(&self, args: &[String], timeout: Duration) -> FleetResult<CommandOutput>;

    /// Run a shell command on the daemon's host.
    async fn shell(&self, command: &str, timeout: Duration) -> FleetResult<CommandOutput>;
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@%+,".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/path-1.0"), "plain/path-1.0");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(125, "no").success());
    }
}
