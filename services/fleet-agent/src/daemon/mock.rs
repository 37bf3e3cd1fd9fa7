//! In-memory daemon for tests and development.
//!
//! Emulates enough of the command surface to exercise allocation and
//! scanning: images by tag, containers with a running flag, and a log of
//! every command received.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dockfleet_id::DockerId;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use super::{image_ref, CommandOutput, Daemon, CONTAINER_INSPECT_FORMAT, ID_FORMAT};
use crate::error::{FleetError, FleetResult};

/// Behaviour knobs for [`MockDaemon`].
#[derive(Debug, Clone, Default)]
pub struct MockDaemonSettings {
    /// Delay applied to `build`, `commit`, and `pull`.
    pub build_delay: Duration,
    /// Report image IDs one character short.
    pub malformed_image_ids: bool,
    /// Verbs that exit non-zero.
    pub failing_verbs: BTreeSet<String>,
    /// Every command fails at the channel level.
    pub unreachable: bool,
}

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    image_ref: String,
    image_id: DockerId,
    running: bool,
    ip_address: String,
}

#[derive(Debug, Default)]
struct MockState {
    /// Image reference to image ID.
    tags: BTreeMap<String, DockerId>,
    images: BTreeSet<DockerId>,
    containers: BTreeMap<DockerId, MockContainer>,
    commands: Vec<Vec<String>>,
    shell_commands: Vec<String>,
    shell_stdout: String,
}

/// Mock daemon for testing and development.
#[derive(Debug)]
pub struct MockDaemon {
    endpoint: String,
    settings: MockDaemonSettings,
    counter: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDaemon {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_settings(endpoint, MockDaemonSettings::default())
    }

    pub fn with_settings(endpoint: impl Into<String>, settings: MockDaemonSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            counter: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    fn next_id(&self) -> FleetResult<DockerId> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let digest = Sha256::digest(format!("{}#{n}", self.endpoint).as_bytes());
        Ok(DockerId::parse(&hex::encode(digest))?)
    }

    // =========================================================================
    // Inspection helpers
    // =========================================================================

    /// Number of `docker` commands received with the given verb.
    pub async fn count(&self, verb: &str) -> usize {
        let state = self.state.lock().await;
        state
            .commands
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(verb))
            .count()
    }

    /// Every `docker` argument vector received, in order.
    pub async fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().await.commands.clone()
    }

    pub async fn shell_commands(&self) -> Vec<String> {
        self.state.lock().await.shell_commands.clone()
    }

    /// Stdout returned by every subsequent shell command.
    pub async fn set_shell_stdout(&self, stdout: impl Into<String>) {
        self.state.lock().await.shell_stdout = stdout.into();
    }

    pub async fn has_image(&self, name: &str) -> bool {
        self.state.lock().await.tags.contains_key(&image_ref(name))
    }

    /// IDs of running containers.
    pub async fn running(&self) -> Vec<DockerId> {
        let state = self.state.lock().await;
        state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Start a container behind the fleet's back.
    pub async fn start_external(&self, image: &str) -> FleetResult<DockerId> {
        let id = self.next_id()?;
        let image_id = self.next_id()?;
        let mut state = self.state.lock().await;
        state.images.insert(image_id.clone());
        state.tags.insert(image_ref(image), image_id.clone());
        let ip_address = format!("172.17.0.{}", state.containers.len() + 2);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: format!("external-{}", id.short()),
                image_ref: image_ref(image),
                image_id,
                running: true,
                ip_address,
            },
        );
        Ok(id)
    }

    /// Remove a container behind the fleet's back.
    pub async fn remove_external(&self, id: &DockerId) {
        self.state.lock().await.containers.remove(id);
    }

    // =========================================================================
    // Command emulation
    // =========================================================================

    fn find_container(state: &MockState, target: &str) -> Option<DockerId> {
        state
            .containers
            .iter()
            .find(|(id, c)| id.matches_prefix(target) || c.name == target)
            .map(|(id, _)| id.clone())
    }

    fn find_image(state: &MockState, target: &str) -> Option<DockerId> {
        if let Some(id) = state.tags.get(&image_ref(target)) {
            return Some(id.clone());
        }
        state
            .images
            .iter()
            .find(|id| id.matches_prefix(target.trim_start_matches("sha256:")))
            .cloned()
    }

    fn render_id(&self, id: &DockerId) -> String {
        if self.settings.malformed_image_ids {
            id.as_str()[..63].to_string()
        } else {
            format!("sha256:{id}")
        }
    }

    fn ps(state: &MockState) -> CommandOutput {
        let mut out = String::from(
            "CONTAINER ID        IMAGE               COMMAND             STATUS              NAMES\n",
        );
        for (id, c) in state.containers.iter().filter(|(_, c)| c.running) {
            out.push_str(&format!(
                "{}        {}        \"/bin/sh\"        Up        {}\n",
                id.short(),
                c.image_ref,
                c.name
            ));
        }
        CommandOutput::ok(out)
    }

    fn inspect(&self, state: &MockState, args: &[String]) -> CommandOutput {
        let (Some(template), Some(target)) = (args.get(2), args.get(3)) else {
            return CommandOutput::failed(1, "usage: inspect -f <template> <target>");
        };

        if let Some(id) = Self::find_container(state, target) {
            if let Some(c) = state.containers.get(&id) {
                if template == CONTAINER_INSPECT_FORMAT {
                    return CommandOutput::ok(format!(
                        "{id} sha256:{} {} {} {}\n",
                        c.image_id, c.image_ref, c.running, c.ip_address
                    ));
                }
                if template == ID_FORMAT {
                    return CommandOutput::ok(format!("{id}\n"));
                }
            }
        }

        if template == ID_FORMAT {
            if let Some(id) = Self::find_image(state, target) {
                return CommandOutput::ok(format!("{}\n", self.render_id(&id)));
            }
        }

        CommandOutput::failed(1, format!("Error: No such object: {target}"))
    }

    fn run(&self, state: &mut MockState, args: &[String]) -> FleetResult<CommandOutput> {
        let mut name = None;
        let mut image = None;
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-d" => {}
                "--name" => name = iter.next().cloned(),
                "-p" | "-v" | "-e" => {
                    iter.next();
                }
                other => {
                    image = Some(other.to_string());
                    break;
                }
            }
        }

        let Some(image) = image else {
            return Ok(CommandOutput::failed(125, "run requires an image"));
        };
        let Some(image_id) = Self::find_image(state, &image) else {
            return Ok(CommandOutput::failed(
                125,
                format!("Unable to find image '{image}' locally"),
            ));
        };

        let id = self.next_id()?;
        let ip_address = format!("172.17.0.{}", state.containers.len() + 2);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: name.unwrap_or_else(|| format!("mock-{}", id.short())),
                image_ref: image_ref(&image),
                image_id,
                running: true,
                ip_address,
            },
        );
        Ok(CommandOutput::ok(format!("{id}\n")))
    }

    fn set_running(state: &mut MockState, target: Option<&String>, running: bool) -> CommandOutput {
        let found = target.and_then(|t| Self::find_container(state, t));
        match found.and_then(|id| state.containers.get_mut(&id).map(|c| (id, c))) {
            Some((id, c)) => {
                c.running = running;
                CommandOutput::ok(format!("{id}\n"))
            }
            None => CommandOutput::failed(
                1,
                format!(
                    "Error: No such container: {}",
                    target.map(String::as_str).unwrap_or_default()
                ),
            ),
        }
    }

    async fn dispatch(&self, args: &[String]) -> FleetResult<CommandOutput> {
        let verb = args.first().map(String::as_str).unwrap_or_default();

        if matches!(verb, "build" | "commit" | "pull") && !self.settings.build_delay.is_zero() {
            tokio::time::sleep(self.settings.build_delay).await;
        }

        let mut state = self.state.lock().await;
        state.commands.push(args.to_vec());

        if self.settings.failing_verbs.contains(verb) {
            return Ok(CommandOutput::failed(
                1,
                format!("[MOCK] {verb} configured to fail"),
            ));
        }

        let output = match verb {
            "ps" => Self::ps(&state),
            "version" => CommandOutput::ok("mock\n"),
            "inspect" => self.inspect(&state, args),
            "build" => {
                let Some(name) = args.get(3) else {
                    return Ok(CommandOutput::failed(1, "build requires -t <name>"));
                };
                let id = self.next_id()?;
                state.images.insert(id.clone());
                state.tags.insert(image_ref(name), id.clone());
                CommandOutput::ok(format!("Successfully built {}\n", id.short()))
            }
            "commit" => {
                let (Some(container), Some(name)) = (args.get(1), args.get(2)) else {
                    return Ok(CommandOutput::failed(1, "commit requires <container> <name>"));
                };
                if Self::find_container(&state, container).is_none() {
                    return Ok(CommandOutput::failed(
                        1,
                        format!("Error: No such container: {container}"),
                    ));
                }
                let id = self.next_id()?;
                state.images.insert(id.clone());
                state.tags.insert(image_ref(name), id.clone());
                CommandOutput::ok(format!("{}\n", self.render_id(&id)))
            }
            "tag" => {
                let (Some(source), Some(target)) = (args.get(2), args.get(3)) else {
                    return Ok(CommandOutput::failed(1, "tag requires -f <id> <ref>"));
                };
                match Self::find_image(&state, source) {
                    Some(id) => {
                        state.tags.insert(image_ref(target), id);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, format!("No such image: {source}")),
                }
            }
            "pull" => {
                let Some(name) = args.get(1) else {
                    return Ok(CommandOutput::failed(1, "pull requires <name>"));
                };
                if !state.tags.contains_key(&image_ref(name)) {
                    let id = self.next_id()?;
                    state.images.insert(id.clone());
                    state.tags.insert(image_ref(name), id);
                }
                CommandOutput::ok(format!("Status: Downloaded newer image for {name}\n"))
            }
            "push" => match args.get(1) {
                Some(name) if state.tags.contains_key(&image_ref(name)) => CommandOutput::ok(""),
                Some(name) => CommandOutput::failed(1, format!("No such image: {name}")),
                None => CommandOutput::failed(1, "push requires <name>"),
            },
            "run" => self.run(&mut state, args)?,
            "exec" => match args.get(1).and_then(|t| Self::find_container(&state, t)) {
                Some(id) if state.containers.get(&id).is_some_and(|c| c.running) => {
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed(1, "container is not running"),
            },
            "stop" | "kill" => Self::set_running(&mut state, args.get(1), false),
            "start" => Self::set_running(&mut state, args.get(1), true),
            "rm" => {
                let found = args.get(2).and_then(|t| Self::find_container(&state, t));
                match found {
                    Some(id) => {
                        state.containers.remove(&id);
                        CommandOutput::ok(format!("{id}\n"))
                    }
                    None => CommandOutput::failed(1, "Error: No such container"),
                }
            }
            other => CommandOutput::failed(1, format!("[MOCK] unsupported command '{other}'")),
        };

        Ok(output)
    }
}

#[async_trait]
impl Daemon for MockDaemon {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn docker(&self, args: &[String], _timeout: Duration) -> FleetResult<CommandOutput> {
        if self.settings.unreachable {
            return Err(FleetError::Daemon(format!(
                "[MOCK] {} unreachable",
                self.endpoint
            )));
        }
        let output = self.dispatch(args).await?;
        debug!(
            endpoint = %self.endpoint,
            args = ?args,
            exit_code = output.exit_code,
            "[MOCK] docker"
        );
        Ok(output)
    }

    async fn shell(&self, command: &str, _timeout: Duration) -> FleetResult<CommandOutput> {
        if self.settings.unreachable {
            return Err(FleetError::Daemon(format!(
                "[MOCK] {} unreachable",
                self.endpoint
            )));
        }
        let mut state = self.state.lock().await;
        state.shell_commands.push(command.to_string());
        debug!(endpoint = %self.endpoint, command, "[MOCK] shell");
        Ok(CommandOutput::ok(state.shell_stdout.clone()))
    }
}
