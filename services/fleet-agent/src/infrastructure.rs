//! The top-level grouping of hosts.

use std::sync::Arc;

use dockfleet_id::InfrastructureId;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cluster::{ClusterAllocator, ClusterPolicy};
use crate::config::InfrastructureConfig;
use crate::container::Container;
use crate::error::FleetResult;
use crate::firewall::{Firewall, NoopFirewall, SecurityGroup};
use crate::host::HostContext;
use crate::image::ImageCacheConfig;
use crate::provision::MachineProvisioner;
use crate::workload::WorkloadSpec;

/// One infrastructure: a cluster of hosts sharing placement policy and a
/// firewall.
#[derive(Debug)]
pub struct Infrastructure {
    id: InfrastructureId,
    name: String,
    min_hosts: usize,
    cluster: ClusterAllocator,
}

impl Infrastructure {
    /// Resolve `config` into a running-ready infrastructure.
    ///
    /// A configured security group becomes the shared firewall; without one
    /// firewall updates are no-ops.
    pub fn new(
        config: &InfrastructureConfig,
        provisioner: Option<Arc<dyn MachineProvisioner>>,
    ) -> FleetResult<Self> {
        let firewall: Arc<dyn Firewall> = match &config.security_group {
            Some(name) => Arc::new(SecurityGroup::new(name.clone(), config.host.open_iptables)),
            None => Arc::new(NoopFirewall),
        };
        Self::with_firewall(config, provisioner, firewall)
    }

    pub fn with_firewall(
        config: &InfrastructureConfig,
        provisioner: Option<Arc<dyn MachineProvisioner>>,
        firewall: Arc<dyn Firewall>,
    ) -> FleetResult<Self> {
        config.validate()?;

        let id = config.id.unwrap_or_default();
        let context = Arc::new(HostContext {
            infrastructure_id: id,
            config: config.host.clone(),
            image_cache: ImageCacheConfig {
                wait_timeout: config.image_wait_timeout(),
            },
            firewall,
            firewall_lock: Arc::new(Mutex::new(())),
        });

        let cluster = ClusterAllocator::new(
            context,
            config.build_strategies()?,
            provisioner,
            ClusterPolicy::from_config(config),
        );

        Ok(Self {
            id,
            name: config.name.clone(),
            min_hosts: config.min_hosts,
            cluster,
        })
    }

    pub fn id(&self) -> InfrastructureId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &ClusterAllocator {
        &self.cluster
    }

    /// Identifiers of the strategy chain, in order.
    pub fn strategy_ids(&self) -> Vec<&'static str> {
        self.cluster.strategies().iter().map(|s| s.id()).collect()
    }

    /// Provision hosts up to `min_hosts` when a provisioner is configured.
    pub async fn start(&self) -> FleetResult<()> {
        if self.cluster.has_provisioner() {
            let existing = self.cluster.hosts().await.len();
            for _ in existing..self.min_hosts {
                self.cluster.add_host(None).await?;
            }
        } else if self.min_hosts > 0 {
            warn!(
                infrastructure_id = %self.id,
                min_hosts = self.min_hosts,
                "No provisioner configured, starting without hosts"
            );
        }

        info!(
            infrastructure_id = %self.id,
            name = %self.name,
            hosts = self.cluster.hosts().await.len(),
            strategies = ?self.strategy_ids(),
            "Infrastructure started"
        );
        Ok(())
    }

    pub async fn obtain(&self, workload: &WorkloadSpec) -> FleetResult<Arc<Container>> {
        self.cluster.obtain(workload).await
    }

    pub async fn release(&self, container: &Container) -> FleetResult<()> {
        self.cluster.release(container).await
    }

    pub async fn shutdown(&self) -> FleetResult<()> {
        info!(infrastructure_id = %self.id, "Shutting down infrastructure");
        self.cluster.shutdown().await
    }
}
