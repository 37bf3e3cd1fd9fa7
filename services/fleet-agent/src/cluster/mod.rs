//! Cluster-level placement and host provisioning.
//!
//! The [`ClusterAllocator`] owns every host of an infrastructure. It picks a
//! host for each new container by running the strategy chain over host
//! snapshots and taking the first survivor. When nothing survives it
//! provisions a new host, one at a time behind a single-permit gate.

pub mod placement;

pub use placement::*;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dockfleet_id::{ContainerId, HostId};
use dockfleet_reconcile::Lifecycle;
use tokio::sync::{Mutex, RwLock, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, warn};

use crate::config::InfrastructureConfig;
use crate::container::Container;
use crate::error::{FleetError, FleetResult};
use crate::host::{Host, HostContext};
use crate::provision::{Machine, MachineProvisioner};
use crate::workload::WorkloadSpec;

/// Behaviour of a [`ClusterAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPolicy {
    /// Tear down hosts left empty by a release, keeping at least one.
    pub remove_empty_hosts: bool,
    /// Placement attempts after losing the provisioning gate.
    pub max_retries: u32,
    /// Pause before re-placing after losing the gate.
    pub retry_backoff: Duration,
    /// Bound on waiting for a chosen host to become ready.
    pub start_timeout: Duration,
}

impl Default for ClusterPolicy {
    fn default() -> Self {
        Self::from_config(&InfrastructureConfig::default())
    }
}

impl ClusterPolicy {
    pub fn from_config(config: &InfrastructureConfig) -> Self {
        Self {
            remove_empty_hosts: config.remove_empty_hosts,
            max_retries: config.placement.max_retries,
            retry_backoff: config.placement.retry_backoff(),
            start_timeout: config.host.start_timeout(),
        }
    }
}

/// Counters for cluster activity.
#[derive(Debug, Default)]
pub struct ClusterStats {
    pub obtained: AtomicU64,
    pub released: AtomicU64,
    pub provisioned: AtomicU64,
    /// Placement attempts that lost the provisioning gate.
    pub contended: AtomicU64,
    pub hosts_removed: AtomicU64,
}

/// Which containers each host received through [`ClusterAllocator::obtain`].
#[derive(Debug, Default)]
struct ClusterMap {
    members: HashMap<HostId, BTreeSet<ContainerId>>,
}

/// Result of one placement attempt.
enum Attempt {
    Done(Arc<Container>),
    Retry,
}

pub struct ClusterAllocator {
    context: Arc<HostContext>,
    strategies: Vec<Arc<dyn PlacementStrategy>>,
    provisioner: Option<Arc<dyn MachineProvisioner>>,
    policy: ClusterPolicy,
    hosts: RwLock<Vec<Arc<Host>>>,
    map: Mutex<ClusterMap>,
    gate: Semaphore,
    closed: AtomicBool,
    stats: ClusterStats,
}

impl ClusterAllocator {
    pub fn new(
        context: Arc<HostContext>,
        strategies: Vec<Arc<dyn PlacementStrategy>>,
        provisioner: Option<Arc<dyn MachineProvisioner>>,
        policy: ClusterPolicy,
    ) -> Self {
        Self {
            context,
            strategies,
            provisioner,
            policy,
            hosts: RwLock::new(Vec::new()),
            map: Mutex::new(ClusterMap::default()),
            gate: Semaphore::new(1),
            closed: AtomicBool::new(false),
            stats: ClusterStats::default(),
        }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.context
    }

    pub fn policy(&self) -> &ClusterPolicy {
        &self.policy
    }

    pub fn strategies(&self) -> &[Arc<dyn PlacementStrategy>] {
        &self.strategies
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn has_provisioner(&self) -> bool {
        self.provisioner.is_some()
    }

    /// Hosts in registration order.
    pub async fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().await.clone()
    }

    pub async fn host(&self, id: HostId) -> Option<Arc<Host>> {
        self.hosts.read().await.iter().find(|h| h.id() == id).cloned()
    }

    /// Containers handed out by `obtain` and not yet released, per host.
    pub async fn tracked(&self) -> BTreeMap<HostId, BTreeSet<ContainerId>> {
        let map = self.map.lock().await;
        map.members
            .iter()
            .map(|(host, set)| (*host, set.clone()))
            .collect()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Place and create a container for `workload`.
    ///
    /// Hosts are tried first-fit after the infrastructure strategies and then
    /// the workload's own. With no survivor a host is provisioned. A caller
    /// that finds provisioning already under way waits for it to finish and
    /// places again, up to `max_retries` times.
    #[instrument(skip(self, workload), fields(workload = %workload.name))]
    pub async fn obtain(&self, workload: &WorkloadSpec) -> FleetResult<Arc<Container>> {
        for attempt in 0..=self.policy.max_retries {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FleetError::ResourceUnavailable(
                    "cluster is shut down".to_string(),
                ));
            }
            if attempt > 0 && !self.policy.retry_backoff.is_zero() {
                tokio::time::sleep(self.policy.retry_backoff).await;
            }

            let host = match self.place(workload).await {
                Some(host) => host,
                None => match self.provision_for(workload).await? {
                    Some(host) => host,
                    None => continue,
                },
            };

            match self.allocate_on(&host, workload).await? {
                Attempt::Done(container) => return Ok(container),
                Attempt::Retry => continue,
            }
        }

        Err(FleetError::ResourceUnavailable(format!(
            "no placement for {} after {} retries",
            workload.name, self.policy.max_retries
        )))
    }

    /// Release a container handed out by [`obtain`](Self::obtain).
    ///
    /// Releasing the same handle again is a no-op, as is releasing one
    /// whose host has already stopped it. A running handle this cluster
    /// never handed out is rejected.
    #[instrument(skip(self, container), fields(container_id = %container.id()))]
    pub async fn release(&self, container: &Container) -> FleetResult<()> {
        let host_id = container.host_id();
        {
            let mut map = self.map.lock().await;
            let claimed = map
                .members
                .get_mut(&host_id)
                .is_some_and(|set| set.remove(&container.id()));
            if !claimed {
                if container.lifecycle().is_stopping_or_stopped() {
                    debug!("Container already released");
                    return Ok(());
                }
                return Err(FleetError::InvalidArgument(format!(
                    "container {} is not tracked by this cluster",
                    container.id()
                )));
            }
            // Claimed under the map lock, so a concurrent second release
            // sees the handle as stopping.
            container.set_lifecycle(Lifecycle::Stopping);
        }

        let Some(host) = self.host(host_id).await else {
            // The host was torn down already, taking the container with it.
            container.close().await;
            return Ok(());
        };

        host.release_container(container).await?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        self.remove_host_if_idle(&host).await
    }

    /// Pick the first host that survives the strategy chain.
    async fn place(&self, workload: &WorkloadSpec) -> Option<Arc<Host>> {
        let hosts = self.hosts().await;
        let cap = self.context.config.max_containers;

        let mut candidates = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let snapshot = host.snapshot().await;
            let unusable =
                snapshot.lifecycle.is_stopping_or_stopped() || snapshot.lifecycle == Lifecycle::OnFire;
            if unusable || snapshot.container_count >= cap {
                continue;
            }
            candidates.push(snapshot);
        }

        let chosen = narrow(
            candidates,
            self.strategies.iter().chain(workload.strategies.iter()),
            workload,
        );
        let first = chosen.first()?;
        debug!(host_id = %first.host_id, hostname = %first.hostname, "Placement chose host");
        hosts.into_iter().find(|h| h.id() == first.host_id)
    }

    /// Provision a host for `workload`, or return `None` if another caller
    /// held the gate and placement should run again.
    async fn provision_for(&self, workload: &WorkloadSpec) -> FleetResult<Option<Arc<Host>>> {
        let Some(provisioner) = &self.provisioner else {
            return Err(FleetError::ResourceUnavailable(format!(
                "no host accepts {} and no provisioner is configured",
                workload.name
            )));
        };

        match self.gate.try_acquire() {
            Ok(_permit) => {
                // A host may have landed between placement and the claim.
                if let Some(host) = self.place(workload).await {
                    return Ok(Some(host));
                }
                let host = self
                    .provision_host(provisioner, workload.hardware_id.as_deref())
                    .await?;
                Ok(Some(host))
            }
            Err(TryAcquireError::NoPermits) => {
                self.stats.contended.fetch_add(1, Ordering::Relaxed);
                debug!("Provisioning in progress, waiting to place again");
                let permit = self.gate.acquire().await.map_err(|_| closed_gate())?;
                drop(permit);
                Ok(None)
            }
            Err(TryAcquireError::Closed) => Err(closed_gate()),
        }
    }

    async fn allocate_on(&self, host: &Arc<Host>, workload: &WorkloadSpec) -> FleetResult<Attempt> {
        host.wait_ready(self.policy.start_timeout).await?;

        let container = match host.create_container(workload).await {
            Ok(container) => container,
            // The host filled up or began shutting down after placement.
            Err(FleetError::NoMachinesAvailable(reason)) => {
                debug!(host_id = %host.id(), reason = %reason, "Host full, placing again");
                return Ok(Attempt::Retry);
            }
            Err(e) if host.lifecycle().is_stopping_or_stopped() => {
                debug!(host_id = %host.id(), error = %e, "Host went away, placing again");
                return Ok(Attempt::Retry);
            }
            Err(e) => return Err(e),
        };

        let registered = {
            let hosts = self.hosts.read().await;
            let registered = hosts.iter().any(|h| h.id() == host.id());
            if registered {
                self.map
                    .lock()
                    .await
                    .members
                    .entry(host.id())
                    .or_default()
                    .insert(container.id());
            }
            registered
        };
        if !registered {
            debug!(host_id = %host.id(), "Host removed during allocation, placing again");
            if let Err(e) = host.release_container(&container).await {
                warn!(container_id = %container.id(), error = %e, "Failed to release orphaned container");
            }
            return Ok(Attempt::Retry);
        }
        self.stats.obtained.fetch_add(1, Ordering::Relaxed);

        info!(
            host_id = %host.id(),
            hostname = %host.hostname(),
            container_id = %container.id(),
            "Container obtained"
        );
        Ok(Attempt::Done(container))
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Provision one more host, waiting for the gate if needed.
    pub async fn add_host(&self, hardware_id: Option<&str>) -> FleetResult<Arc<Host>> {
        let Some(provisioner) = &self.provisioner else {
            return Err(FleetError::ResourceUnavailable(
                "no provisioner is configured".to_string(),
            ));
        };
        let _permit = self.gate.acquire().await.map_err(|_| closed_gate())?;
        self.provision_host(provisioner, hardware_id).await
    }

    /// Start a host on an existing machine and register it.
    pub async fn register_machine(&self, machine: Machine) -> FleetResult<Arc<Host>> {
        let host = Host::new(machine, Arc::clone(&self.context));
        host.start().await?;
        self.register(Arc::clone(&host)).await;
        Ok(host)
    }

    async fn provision_host(
        &self,
        provisioner: &Arc<dyn MachineProvisioner>,
        hardware_id: Option<&str>,
    ) -> FleetResult<Arc<Host>> {
        let machine = provisioner.obtain(hardware_id).await.map_err(|e| match e {
            FleetError::NoMachinesAvailable(_) => e,
            other => FleetError::NoMachinesAvailable(other.to_string()),
        })?;

        let host = Host::new(machine, Arc::clone(&self.context));
        if let Err(e) = host.start().await {
            warn!(hostname = %host.hostname(), error = %e, "Provisioned host failed to start");
            if let Err(release) = provisioner.release(host.machine()).await {
                warn!(hostname = %host.hostname(), error = %release, "Failed to return machine");
            }
            return Err(e);
        }

        self.register(Arc::clone(&host)).await;
        self.stats.provisioned.fetch_add(1, Ordering::Relaxed);
        info!(host_id = %host.id(), hostname = %host.hostname(), "Provisioned host");
        Ok(host)
    }

    async fn register(&self, host: Arc<Host>) {
        let mut hosts = self.hosts.write().await;
        self.map.lock().await.members.entry(host.id()).or_default();
        hosts.push(host);
    }

    /// Tear `host` down if the policy allows, it is idle, and it is not the
    /// last host.
    async fn remove_host_if_idle(&self, host: &Arc<Host>) -> FleetResult<()> {
        if !self.policy.remove_empty_hosts {
            return Ok(());
        }

        {
            let mut hosts = self.hosts.write().await;
            if hosts.len() <= 1 || !host.is_idle().await {
                return Ok(());
            }
            let mut map = self.map.lock().await;
            if map.members.get(&host.id()).is_some_and(|set| !set.is_empty()) {
                return Ok(());
            }
            map.members.remove(&host.id());
            hosts.retain(|h| h.id() != host.id());
        }

        info!(host_id = %host.id(), hostname = %host.hostname(), "Removing empty host");
        self.teardown(host).await?;
        self.stats.hosts_removed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn teardown(&self, host: &Host) -> FleetResult<()> {
        host.stop().await?;
        if let Some(provisioner) = &self.provisioner {
            provisioner.release(host.machine()).await?;
        }
        Ok(())
    }

    /// Stop every host and return their machines.
    ///
    /// The cluster is empty afterwards and refuses further allocations;
    /// calling this again does nothing.
    pub async fn shutdown(&self) -> FleetResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let hosts = std::mem::take(&mut *self.hosts.write().await);
        self.map.lock().await.members.clear();

        let mut first_error = None;
        for host in &hosts {
            if let Err(e) = self.teardown(host).await {
                warn!(host_id = %host.id(), error = %e, "Host teardown failed");
                first_error.get_or_insert(e);
            }
        }
        if !hosts.is_empty() {
            info!(hosts = hosts.len(), "Cluster shut down");
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ClusterAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAllocator")
            .field("strategies", &self.strategies)
            .field("has_provisioner", &self.provisioner.is_some())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn closed_gate() -> FleetError {
    FleetError::ResourceUnavailable("provisioning gate closed".to_string())
}
