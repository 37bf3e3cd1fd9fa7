//! Process-backed daemon channel.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{shell_quote, CommandOutput, Daemon};
use crate::error::{FleetError, FleetResult};

/// Runs `docker` and `sh` as child processes, locally or over `ssh`.
#[derive(Debug, Clone)]
pub struct ShellDaemon {
    /// Value for `docker -H`; `None` uses the client default.
    endpoint: Option<String>,
    /// `user@host` when the daemon host is remote.
    ssh_target: Option<String>,
    docker_bin: String,
}

impl ShellDaemon {
    /// A daemon reachable from this machine's docker client.
    pub fn local(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            ssh_target: None,
            docker_bin: "docker".to_string(),
        }
    }

    /// A daemon whose host is reached over ssh.
    pub fn over_ssh(ssh_target: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            ssh_target: Some(ssh_target.into()),
            docker_bin: "docker".to_string(),
        }
    }

    fn docker_argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(endpoint) = &self.endpoint {
            argv.push("-H".to_string());
            argv.push(endpoint.clone());
        }
        argv.extend(args.iter().cloned());
        argv
    }

    async fn execute(
        &self,
        program: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> FleetResult<CommandOutput> {
        debug!(program, args = ?args, "Executing daemon command");

        let started = Instant::now();
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| FleetError::Timeout {
                what: format!("{program} {}", args.join(" ")),
                elapsed: started.elapsed(),
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Daemon for ShellDaemon {
    fn endpoint(&self) -> String {
        match (&self.ssh_target, &self.endpoint) {
            (Some(target), Some(ep)) => format!("{target}/{ep}"),
            (Some(target), None) => target.clone(),
            (None, Some(ep)) => ep.clone(),
            (None, None) => "local".to_string(),
        }
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> FleetResult<CommandOutput> {
        let argv = self.docker_argv(args);
        match &self.ssh_target {
            Some(target) => {
                let remote = std::iter::once(self.docker_bin.as_str())
                    .chain(argv.iter().map(String::as_str))
                    .map(shell_quote)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.execute("ssh", vec![target.clone(), "--".to_string(), remote], timeout)
                    .await
            }
            None => self.execute(&self.docker_bin, argv, timeout).await,
        }
    }

    async fn shell(&self, command: &str, timeout: Duration) -> FleetResult<CommandOutput> {
        match &self.ssh_target {
            Some(target) => {
                self.execute(
                    "ssh",
                    vec![target.clone(), "--".to_string(), command.to_string()],
                    timeout,
                )
                .await
            }
            None => {
                self.execute("sh", vec!["-c".to_string(), command.to_string()], timeout)
                    .await
            }
        }
    }
}
