//! Configuration for the fleet agent.
//!
//! Process settings come from `FLEET_*` environment variables. The
//! infrastructure itself (strategies, host defaults, machine pool) is
//! described in a TOML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dockfleet_id::InfrastructureId;
use serde::{Deserialize, Serialize};

use crate::cluster::{build_chain, PlacementStrategy, StrategyConfig, DEFAULT_MAX_CONTAINERS};
use crate::error::{FleetError, FleetResult};

/// Fleet agent process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Infrastructure description file.
    pub config_path: Option<PathBuf>,

    /// Overrides the infrastructure name from the file.
    pub infrastructure_name: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let config_path = std::env::var("FLEET_CONFIG").ok().map(PathBuf::from);

        let infrastructure_name = std::env::var("FLEET_INFRASTRUCTURE_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self {
            config_path,
            infrastructure_name,
            log_level,
        }
    }

    /// Load the infrastructure description, falling back to defaults when
    /// no file is configured.
    pub fn load_infrastructure(&self) -> FleetResult<InfrastructureConfig> {
        let mut infra = match &self.config_path {
            Some(path) => InfrastructureConfig::load(path)?,
            None => InfrastructureConfig::default(),
        };
        if let Some(name) = &self.infrastructure_name {
            infra.name = name.clone();
        }
        Ok(infra)
    }
}

/// Description of one infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    /// Stable ID, so location strings survive restarts.
    pub id: Option<InfrastructureId>,
    pub name: String,
    /// Strategy chain, applied in order.
    pub strategies: Vec<StrategyConfig>,
    /// Tear down hosts left empty by a release, keeping at least one.
    pub remove_empty_hosts: bool,
    /// Hosts provisioned at start.
    pub min_hosts: usize,
    /// Bound on waiting for another caller's image build.
    pub image_wait_timeout_secs: u64,
    /// Shared inbound rule set; without one, firewall updates are no-ops.
    pub security_group: Option<String>,
    pub placement: PlacementConfig,
    pub host: HostConfig,
    pub pool: PoolConfig,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "default".to_string(),
            strategies: vec![StrategyConfig::MaxContainers { max: None }],
            remove_empty_hosts: false,
            min_hosts: 1,
            image_wait_timeout_secs: 15 * 60,
            security_group: None,
            placement: PlacementConfig::default(),
            host: HostConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl InfrastructureConfig {
    pub fn load(path: &Path) -> FleetResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> FleetResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config("infrastructure name is empty".into()));
        }
        if self.host.max_containers == 0 {
            return Err(FleetError::Config("host.max_containers must be positive".into()));
        }
        if self.host.container_name_prefix.trim().is_empty() {
            return Err(FleetError::Config(
                "host.container_name_prefix is empty".into(),
            ));
        }
        self.build_strategies()?;
        Ok(())
    }

    /// Resolve the strategy chain into instances.
    pub fn build_strategies(&self) -> FleetResult<Vec<std::sync::Arc<dyn PlacementStrategy>>> {
        build_chain(&self.strategies, self.host.max_containers)
    }

    pub fn image_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.image_wait_timeout_secs)
    }
}

/// Retry behaviour of placement under provisioning contention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_retries: 32,
            retry_backoff_ms: 0,
        }
    }
}

impl PlacementConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Defaults and limits applied to every host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host directory for build contexts and deployed volumes.
    pub run_dir: String,
    /// Image used when a workload names no other source.
    pub base_image: Option<String>,
    /// Layer sshd onto pulled base images.
    pub use_ssh: bool,
    pub env: BTreeMap<String, String>,
    /// Host path to container path.
    pub volumes: BTreeMap<String, String>,
    pub max_containers: usize,
    /// Zero disables periodic scanning.
    pub scan_interval_secs: u64,
    pub start_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Bound on build, commit, pull, push, and install commands.
    pub build_timeout_secs: u64,
    /// Mirror opened ports into the host's iptables.
    pub open_iptables: bool,
    pub container_name_prefix: String,
    pub hardware_id: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            run_dir: "/tmp/dockfleet".to_string(),
            base_image: None,
            use_ssh: false,
            env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            max_containers: DEFAULT_MAX_CONTAINERS,
            scan_interval_secs: dockfleet_reconcile::DEFAULT_SCAN_INTERVAL.as_secs(),
            start_timeout_secs: 5 * 60,
            command_timeout_secs: 2 * 60,
            build_timeout_secs: 20 * 60,
            open_iptables: false,
            container_name_prefix: "dockfleet".to_string(),
            hardware_id: None,
        }
    }
}

impl HostConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Static machine pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub hosts: Vec<PoolHostConfig>,
}

/// One daemon machine in the static pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHostConfig {
    pub hostname: String,
    /// Value for `docker -H`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// `user@host` for hosts reached over ssh.
    #[serde(default)]
    pub ssh: Option<String>,
    #[serde(default)]
    pub hardware_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = InfrastructureConfig::default();
        assert_eq!(config.min_hosts, 1);
        assert_eq!(config.placement.max_retries, 32);
        assert_eq!(config.host.max_containers, 8);
        assert_eq!(config.host.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.image_wait_timeout(), Duration::from_secs(900));
        assert_eq!(config.build_strategies().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_full_file() {
        let config = InfrastructureConfig::from_toml_str(
            r#"
            name = "prod"
            remove_empty_hosts = true
            min_hosts = 2
            security_group = "dockfleet-prod"
            strategies = [
                { type = "group", exclusive = false },
                { type = "max-containers", max = 4 },
                { type = "breadth-first" },
            ]

            [placement]
            max_retries = 5
            retry_backoff_ms = 250

            [host]
            base_image = "ubuntu:22.04"
            use_ssh = true
            open_iptables = true
            scan_interval_secs = 10

            [host.env]
            REGION = "eu-west-1"

            [[pool.hosts]]
            hostname = "node-1"
            endpoint = "tcp://10.0.0.5:2375"

            [[pool.hosts]]
            hostname = "node-2"
            ssh = "core@10.0.0.6"
            hardware_id = "m5.large"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "prod");
        assert!(config.remove_empty_hosts);
        assert_eq!(config.strategies.len(), 3);
        assert_eq!(config.placement.retry_backoff(), Duration::from_millis(250));
        assert_eq!(config.host.base_image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(config.host.env["REGION"], "eu-west-1");
        assert_eq!(config.host.max_containers, 8);
        assert_eq!(config.pool.hosts.len(), 2);
        assert_eq!(config.pool.hosts[1].ssh.as_deref(), Some("core@10.0.0.6"));
    }

    #[test]
    fn test_unknown_strategy_rejected_at_load() {
        let err = InfrastructureConfig::from_toml_str(
            r#"strategies = [{ type = "round-robin" }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_bad_hostname_pattern_rejected_at_load() {
        let err = InfrastructureConfig::from_toml_str(
            r#"strategies = [{ type = "hostname", pattern = "node-(" }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_load_from_file_with_name_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"from-file\"\nmin_hosts = 0").unwrap();

        let config = Config {
            config_path: Some(file.path().to_path_buf()),
            infrastructure_name: Some("override".into()),
            log_level: "debug".into(),
        };
        let infra = config.load_infrastructure().unwrap();
        assert_eq!(infra.name, "override");
        assert_eq!(infra.min_hosts, 0);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let config = Config {
            config_path: Some(PathBuf::from("/nonexistent/dockfleet.toml")),
            infrastructure_name: None,
            log_level: "info".into(),
        };
        assert!(matches!(
            config.load_infrastructure(),
            Err(FleetError::Config(_))
        ));
    }
}
