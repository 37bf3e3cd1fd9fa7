//! A single daemon host.
//!
//! A host owns its container membership, a per-host read/write lock, and
//! the image latches for builds running on it:
//!
//! - allocation and release take the lock for read, so they run side by
//!   side
//! - a membership scan takes it for write, so it never overlaps either
//!
//! See `allocator` for container creation and `scanner` for reconciliation.

mod allocator;
mod scanner;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dockfleet_id::{ContainerId, HostId, InfrastructureId};
use dockfleet_reconcile::Lifecycle;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::cluster::HostSnapshot;
use crate::config::HostConfig;
use crate::container::Container;
use crate::daemon::DockerCli;
use crate::error::{FleetError, FleetResult};
use crate::firewall::Firewall;
use crate::image::{ImageCache, ImageCacheConfig};
use crate::provision::Machine;

pub use scanner::ScanReport;

use scanner::ScannerHandle;

/// Settings and shared resources common to every host of an infrastructure.
#[derive(Debug)]
pub struct HostContext {
    pub infrastructure_id: InfrastructureId,
    pub config: HostConfig,
    pub image_cache: ImageCacheConfig,
    pub firewall: Arc<dyn Firewall>,
    /// Serializes firewall updates across hosts.
    pub firewall_lock: Arc<Mutex<()>>,
}

/// One daemon endpoint and the containers it runs.
pub struct Host {
    id: HostId,
    machine: Machine,
    context: Arc<HostContext>,
    docker: DockerCli,
    lock: RwLock<()>,
    members: Mutex<BTreeMap<ContainerId, Arc<Container>>>,
    /// Allocations in flight, counted against the container cap.
    reserved: AtomicUsize,
    images: ImageCache,
    lifecycle: watch::Sender<Lifecycle>,
    name_counter: AtomicU64,
    /// Last CPU reading as f64 bits; NaN when unknown.
    cpu_usage: AtomicU64,
    scanner: Mutex<Option<ScannerHandle>>,
}

impl Host {
    pub fn new(machine: Machine, context: Arc<HostContext>) -> Arc<Self> {
        let docker = DockerCli::new(
            Arc::clone(&machine.daemon),
            context.config.command_timeout(),
            context.config.build_timeout(),
        );
        let (lifecycle, _) = watch::channel(Lifecycle::Created);

        Arc::new(Self {
            id: HostId::new(),
            images: ImageCache::new(context.image_cache.clone()),
            machine,
            context,
            docker,
            lock: RwLock::new(()),
            members: Mutex::new(BTreeMap::new()),
            reserved: AtomicUsize::new(0),
            lifecycle,
            name_counter: AtomicU64::new(0),
            cpu_usage: AtomicU64::new(f64::NAN.to_bits()),
            scanner: Mutex::new(None),
        })
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.machine.hostname
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn config(&self) -> &HostConfig {
        &self.context.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let previous = self.lifecycle.send_replace(next);
        if previous != next {
            info!(host_id = %self.id, from = %previous, to = %next, "Host lifecycle changed");
        }
    }

    pub fn cpu_usage(&self) -> Option<f64> {
        let value = f64::from_bits(self.cpu_usage.load(Ordering::Relaxed));
        (!value.is_nan()).then_some(value)
    }

    /// Record a CPU reading, as a fraction of capacity.
    pub fn record_cpu_usage(&self, usage: f64) {
        self.cpu_usage.store(usage.to_bits(), Ordering::Relaxed);
    }

    pub async fn members(&self) -> Vec<Arc<Container>> {
        self.members.lock().await.values().cloned().collect()
    }

    pub async fn member(&self, id: ContainerId) -> Option<Arc<Container>> {
        self.members.lock().await.get(&id).cloned()
    }

    pub async fn container_count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// No members and no allocation in flight.
    pub async fn is_idle(&self) -> bool {
        let members = self.members.lock().await;
        members.is_empty() && self.reserved.load(Ordering::SeqCst) == 0
    }

    /// View of the host for placement. In-flight allocations count
    /// towards the container total.
    pub async fn snapshot(&self) -> HostSnapshot {
        let members = self.members.lock().await;
        let mut snapshot = HostSnapshot {
            host_id: self.id,
            hostname: self.hostname().to_string(),
            lifecycle: self.lifecycle(),
            container_count: members.len() + self.reserved.load(Ordering::SeqCst),
            cpu_usage: self.cpu_usage(),
            workloads: Default::default(),
            parents: Default::default(),
            applications: Default::default(),
        };
        for container in members.values() {
            let record = container.record();
            snapshot.workloads.extend(record.workload_id);
            snapshot.parents.extend(record.parent_id);
            snapshot.applications.extend(record.application_id);
        }
        snapshot
    }

    /// Bring the host up: probe the daemon, then start periodic scanning.
    pub async fn start(self: &Arc<Self>) -> FleetResult<()> {
        self.set_lifecycle(Lifecycle::Starting);

        if let Err(e) = self.docker.ps().await {
            warn!(host_id = %self.id, error = %e, "Daemon probe failed");
            self.set_lifecycle(Lifecycle::OnFire);
            return Err(e);
        }

        self.set_lifecycle(Lifecycle::Running);

        let interval = self.context.config.scan_interval();
        if !interval.is_zero() {
            *self.scanner.lock().await = Some(scanner::spawn(Arc::clone(self), interval));
        }

        info!(
            host_id = %self.id,
            hostname = %self.hostname(),
            endpoint = %self.machine.daemon.endpoint(),
            "Host started"
        );
        Ok(())
    }

    /// Wait until the host has left its startup states.
    pub async fn wait_ready(&self, timeout: Duration) -> FleetResult<()> {
        let mut rx = self.lifecycle.subscribe();
        let started = Instant::now();

        let state = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, Lifecycle::Created | Lifecycle::Starting)),
        )
        .await
        .map_err(|_| FleetError::Timeout {
            what: format!("host {} to start", self.id),
            elapsed: started.elapsed(),
        })?
        .map(|state| *state)
        .unwrap_or(Lifecycle::Stopped);

        match state {
            Lifecycle::Running => Ok(()),
            other => Err(FleetError::ResourceUnavailable(format!(
                "host {} is {other}",
                self.id
            ))),
        }
    }

    /// Stop scanning, stop every member, and mark the host stopped.
    ///
    /// Calling this again after the first call is a no-op.
    pub async fn stop(&self) -> FleetResult<()> {
        let began = self.lifecycle.send_if_modified(|state| {
            if state.is_stopping_or_stopped() {
                false
            } else {
                *state = Lifecycle::Stopping;
                true
            }
        });
        if !began {
            return Ok(());
        }
        info!(host_id = %self.id, "Stopping host");

        if let Some(scanner) = self.scanner.lock().await.take() {
            scanner.stop().await;
        }

        let _exclusive = self.lock.write().await;
        let members = std::mem::take(&mut *self.members.lock().await);
        for container in members.values() {
            if let Err(e) = self.docker.stop(container.docker_id()).await {
                warn!(
                    host_id = %self.id,
                    container_id = %container.id(),
                    error = %e,
                    "Failed to stop container during host shutdown"
                );
            }
            container.close().await;
        }

        self.set_lifecycle(Lifecycle::Stopped);
        info!(host_id = %self.id, stopped = members.len(), "Host stopped");
        Ok(())
    }
}
