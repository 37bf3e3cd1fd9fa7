//! Workload requests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use dockfleet_id::{AppId, WorkloadId};
use dockfleet_reconcile::ContentHash;
use serde::{Deserialize, Serialize};

use crate::cluster::PlacementStrategy;

/// Port always opened on every container.
pub const SSH_PORT: u16 = 22;

/// Inclusive range of container ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Where a workload's image comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSource {
    /// Explicit image name, replacing the computed one.
    pub image_name: Option<String>,
    /// Image to pull and run directly.
    pub base_image: Option<String>,
    /// Dockerfile to build from.
    pub dockerfile_url: Option<String>,
    /// Build context archive, extracted around the Dockerfile.
    pub context_archive_url: Option<String>,
    /// Existing image to tag and install onto.
    pub image_id: Option<String>,
    /// Layer an sshd image on top of the base image.
    pub use_ssh: Option<bool>,
}

/// Request for one container.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub id: WorkloadId,
    pub name: String,
    pub application_id: Option<AppId>,
    pub parent_id: Option<WorkloadId>,
    pub version: Option<String>,
    pub image: ImageSource,
    /// Run inside the container before it is committed.
    pub install_command: Option<String>,
    /// Push the committed image after install.
    pub push_image: bool,
    pub port_ranges: Vec<PortRange>,
    pub open_ports: Vec<u16>,
    /// Host port to container port.
    pub port_bindings: BTreeMap<u16, u16>,
    /// Host path to container path.
    pub volumes: BTreeMap<String, String>,
    /// Download URL to container path.
    pub url_volumes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub hardware_id: Option<String>,
    /// Applied after the infrastructure's own strategies.
    pub strategies: Vec<Arc<dyn PlacementStrategy>>,
}

impl WorkloadSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkloadId::new(),
            name: name.into(),
            application_id: None,
            parent_id: None,
            version: None,
            image: ImageSource::default(),
            install_command: None,
            push_image: false,
            port_ranges: Vec::new(),
            open_ports: Vec::new(),
            port_bindings: BTreeMap::new(),
            volumes: BTreeMap::new(),
            url_volumes: BTreeMap::new(),
            env: BTreeMap::new(),
            hardware_id: None,
            strategies: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = image;
        self
    }

    pub fn with_application(mut self, application_id: AppId) -> Self {
        self.application_id = Some(application_id);
        self
    }

    pub fn with_parent(mut self, parent_id: WorkloadId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_install(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    pub fn with_port_binding(mut self, host: u16, container: u16) -> Self {
        self.port_bindings.insert(host, container);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Name the workload's image is tagged under.
    ///
    /// An explicit name wins, with any `:latest` suffix dropped. Otherwise
    /// the name is a hash of every input that shapes the image, so equal
    /// inputs share one build.
    pub fn image_name(&self) -> String {
        if let Some(name) = &self.image.image_name {
            let name = name.trim().to_ascii_lowercase();
            return name.strip_suffix(":latest").unwrap_or(&name).to_string();
        }

        let inputs = serde_json::json!({
            "name": self.name,
            "version": self.version,
            "base_image": self.image.base_image,
            "dockerfile_url": self.image.dockerfile_url,
            "context_archive_url": self.image.context_archive_url,
            "image_id": self.image.image_id,
            "install_command": self.install_command,
            "env": self.env,
        });
        ContentHash::from_json(&inputs).to_string()
    }

    /// Container ports to open: declared ranges, direct ports, and ssh.
    pub fn open_port_set(&self) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self.port_ranges.iter().flat_map(PortRange::ports).collect();
        ports.extend(self.open_ports.iter().copied());
        ports.insert(SSH_PORT);
        ports
    }

    /// Host ports the workload binds explicitly.
    pub fn bound_host_ports(&self) -> BTreeSet<u16> {
        self.port_bindings.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_is_deterministic() {
        let a = WorkloadSpec::new("web").with_install("make install");
        let mut b = WorkloadSpec::new("web").with_install("make install");
        assert_ne!(a.id, b.id);
        assert_eq!(a.image_name(), b.image_name());

        b.version = Some("2".into());
        assert_ne!(a.image_name(), b.image_name());
    }

    #[test]
    fn test_computed_image_name_shape() {
        let name = WorkloadSpec::new("Web Server").image_name();
        assert_eq!(name.len(), 32);
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_explicit_image_name() {
        let spec = WorkloadSpec::new("web").with_image(ImageSource {
            image_name: Some("Acme/Foo:latest".into()),
            ..Default::default()
        });
        assert_eq!(spec.image_name(), "acme/foo");
    }

    #[test]
    fn test_open_ports_always_include_ssh() {
        let mut spec = WorkloadSpec::new("web");
        assert_eq!(spec.open_port_set(), BTreeSet::from([22]));

        spec.port_ranges.push(PortRange { start: 8000, end: 8002 });
        spec.open_ports.push(9090);
        assert_eq!(
            spec.open_port_set(),
            BTreeSet::from([22, 8000, 8001, 8002, 9090])
        );
    }

    #[test]
    fn test_port_range_display() {
        assert_eq!(PortRange::single(80).to_string(), "80");
        assert_eq!(PortRange { start: 80, end: 90 }.to_string(), "80-90");
    }
}
