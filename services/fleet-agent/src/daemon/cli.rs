//! Typed wrapper over the daemon command surface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dockfleet_id::DockerId;
use dockfleet_reconcile::{parse_ps_output, LiveContainer};
use tracing::debug;

use super::{CommandOutput, Daemon};
use crate::error::{FleetError, FleetResult};

/// Inspect template yielding an object's full ID.
pub const ID_FORMAT: &str = "{{.Id}}";

/// Inspect template for the fields needed to adopt a container.
pub const CONTAINER_INSPECT_FORMAT: &str =
    "{{.Id}} {{.Image}} {{.Config.Image}} {{.State.Running}} {{.NetworkSettings.IPAddress}}";

/// Reference an image name by its `latest` tag unless it is already tagged.
pub fn image_ref(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

fn command_failure(args: &[String], output: &CommandOutput) -> FleetError {
    FleetError::BuildFailure {
        command: format!("docker {}", args.join(" ")),
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_string(),
    }
}

/// True if a failed inspect says the object does not exist.
fn reports_missing(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such image")
}

/// Fields read back from a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: DockerId,
    pub image_id: DockerId,
    pub image_name: String,
    pub running: bool,
    pub ip_address: Option<String>,
}

impl ContainerInfo {
    /// Parse the output of [`CONTAINER_INSPECT_FORMAT`].
    pub fn parse(output: &str) -> FleetResult<Self> {
        let fields: Vec<&str> = output.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(FleetError::ParseFailure(format!(
                "container inspect output has {} fields: {}",
                fields.len(),
                output.trim()
            )));
        }

        let running = match fields[3] {
            "true" => true,
            "false" => false,
            other => {
                return Err(FleetError::ParseFailure(format!(
                    "container running flag '{other}'"
                )))
            }
        };

        Ok(Self {
            id: DockerId::parse(fields[0])?,
            image_id: DockerId::parse(fields[1])?,
            image_name: fields[2].to_string(),
            running,
            ip_address: fields.get(4).map(|ip| ip.to_string()),
        })
    }
}

/// Arguments for `run -d`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Host path to container path.
    pub volumes: BTreeMap<String, String>,
    /// Host port to container port.
    pub port_bindings: BTreeMap<u16, u16>,
    /// Container ports published on daemon-chosen host ports.
    pub exposed_ports: BTreeSet<u16>,
}

impl RunSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        for (host, container) in &self.port_bindings {
            args.push("-p".to_string());
            args.push(format!("{host}:{container}"));
        }
        let bound: BTreeSet<u16> = self.port_bindings.values().copied().collect();
        for port in self.exposed_ports.difference(&bound) {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for (host, container) in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Daemon command surface with output validation.
#[derive(Debug, Clone)]
pub struct DockerCli {
    daemon: Arc<dyn Daemon>,
    command_timeout: Duration,
    build_timeout: Duration,
}

impl DockerCli {
    pub fn new(daemon: Arc<dyn Daemon>, command_timeout: Duration, build_timeout: Duration) -> Self {
        Self {
            daemon,
            command_timeout,
            build_timeout,
        }
    }

    pub fn daemon(&self) -> &Arc<dyn Daemon> {
        &self.daemon
    }

    async fn raw(&self, args: Vec<String>, timeout: Duration) -> FleetResult<CommandOutput> {
        debug!(endpoint = %self.daemon.endpoint(), args = ?args, "docker");
        self.daemon.docker(&args, timeout).await
    }

    async fn checked(&self, args: Vec<String>, timeout: Duration) -> FleetResult<CommandOutput> {
        let output = self.raw(args.clone(), timeout).await?;
        if !output.success() {
            return Err(command_failure(&args, &output));
        }
        Ok(output)
    }

    /// Running containers.
    pub async fn ps(&self) -> FleetResult<Vec<LiveContainer>> {
        let output = self.checked(vec!["ps".into()], self.command_timeout).await?;
        Ok(parse_ps_output(&output.stdout)?)
    }

    /// Output of `inspect -f <template> <target>`.
    pub async fn inspect(&self, template: &str, target: &str) -> FleetResult<String> {
        let output = self
            .checked(
                vec!["inspect".into(), "-f".into(), template.into(), target.into()],
                self.command_timeout,
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// ID of the image tagged `name`, or `None` if there is no such tag.
    ///
    /// Any other inspect failure is an error.
    pub async fn image_id(&self, name: &str) -> FleetResult<Option<DockerId>> {
        let args = vec!["inspect".into(), "-f".into(), ID_FORMAT.into(), image_ref(name)];
        let output = self.raw(args.clone(), self.command_timeout).await?;
        if !output.success() {
            if reports_missing(&output.stderr) {
                return Ok(None);
            }
            return Err(command_failure(&args, &output));
        }
        Ok(Some(DockerId::parse(&output.stdout)?))
    }

    pub async fn inspect_container(&self, id: &str) -> FleetResult<ContainerInfo> {
        let output = self.inspect(CONTAINER_INSPECT_FORMAT, id).await?;
        ContainerInfo::parse(&output)
    }

    /// `build --rm -t <name> <dir>`, returning the built image's ID.
    pub async fn build(&self, name: &str, dir: &str) -> FleetResult<DockerId> {
        self.checked(
            vec![
                "build".into(),
                "--rm".into(),
                "-t".into(),
                name.into(),
                dir.into(),
            ],
            self.build_timeout,
        )
        .await?;
        let id = self.inspect(ID_FORMAT, name).await?;
        Ok(DockerId::parse(&id)?)
    }

    /// `commit <container> <name>`, returning the new image's ID.
    pub async fn commit(&self, container: &DockerId, name: &str) -> FleetResult<DockerId> {
        let output = self
            .checked(
                vec!["commit".into(), container.to_string(), name.into()],
                self.build_timeout,
            )
            .await?;
        Ok(DockerId::parse(&output.stdout)?)
    }

    /// `tag -f <id> <name>:latest`.
    pub async fn tag(&self, id: &DockerId, name: &str) -> FleetResult<()> {
        self.checked(
            vec!["tag".into(), "-f".into(), id.to_string(), image_ref(name)],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    /// `pull <name>`, returning the pulled image's ID.
    pub async fn pull(&self, name: &str) -> FleetResult<DockerId> {
        self.checked(vec!["pull".into(), name.into()], self.build_timeout)
            .await?;
        self.image_id(name).await?.ok_or_else(|| {
            FleetError::ParseFailure(format!("pull of {name} left no image behind"))
        })
    }

    pub async fn push(&self, name: &str) -> FleetResult<()> {
        self.checked(vec!["push".into(), name.into()], self.build_timeout)
            .await?;
        Ok(())
    }

    /// `run -d ...`, returning the new container's ID.
    pub async fn run(&self, spec: &RunSpec) -> FleetResult<DockerId> {
        let output = self.checked(spec.to_args(), self.command_timeout).await?;
        Ok(DockerId::parse(&output.stdout)?)
    }

    /// Run a shell command inside a container.
    pub async fn exec(&self, id: &DockerId, command: &str) -> FleetResult<CommandOutput> {
        self.checked(
            vec![
                "exec".into(),
                id.to_string(),
                "sh".into(),
                "-c".into(),
                command.into(),
            ],
            self.build_timeout,
        )
        .await
    }

    pub async fn stop(&self, id: &DockerId) -> FleetResult<()> {
        self.checked(vec!["stop".into(), id.to_string()], self.command_timeout)
            .await?;
        Ok(())
    }

    pub async fn kill(&self, id: &DockerId) -> FleetResult<()> {
        self.checked(vec!["kill".into(), id.to_string()], self.command_timeout)
            .await?;
        Ok(())
    }

    pub async fn start(&self, id: &DockerId) -> FleetResult<()> {
        self.checked(vec!["start".into(), id.to_string()], self.command_timeout)
            .await?;
        Ok(())
    }

    /// `rm -f <id>`.
    pub async fn remove(&self, id: &DockerId) -> FleetResult<()> {
        self.checked(
            vec!["rm".into(), "-f".into(), id.to_string()],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    /// Run a shell command on the daemon host, failing on non-zero exit.
    pub async fn host_shell(&self, command: &str) -> FleetResult<CommandOutput> {
        let output = self.daemon.shell(command, self.command_timeout).await?;
        if !output.success() {
            return Err(FleetError::BuildFailure {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}
