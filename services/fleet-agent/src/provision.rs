//! Machine pools.
//!
//! The fleet never creates machines itself. It asks a [`MachineProvisioner`]
//! for one when placement finds no room, and hands it back when the host is
//! torn down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockfleet_id::MachineId;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::daemon::{Daemon, MockDaemon, MockDaemonSettings, ShellDaemon};
use crate::error::{FleetError, FleetResult};

/// A machine running a container daemon.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub hostname: String,
    pub hardware_id: Option<String>,
    pub daemon: Arc<dyn Daemon>,
}

impl Machine {
    pub fn new(hostname: impl Into<String>, daemon: Arc<dyn Daemon>) -> Self {
        Self {
            id: MachineId::new(),
            hostname: hostname.into(),
            hardware_id: None,
            daemon,
        }
    }
}

/// Source of daemon machines.
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    /// Obtain a machine, preferring the given hardware profile.
    async fn obtain(&self, hardware_id: Option<&str>) -> FleetResult<Machine>;

    /// Return a machine. Returning one twice is not an error.
    async fn release(&self, machine: &Machine) -> FleetResult<()>;
}

// =============================================================================
// Static pool
// =============================================================================

/// Fixed list of daemon endpoints.
pub struct StaticPool {
    available: Mutex<VecDeque<Machine>>,
    in_use: Mutex<Vec<Machine>>,
}

impl StaticPool {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            available: Mutex::new(machines.into()),
            in_use: Mutex::new(Vec::new()),
        }
    }

    /// Build a pool of process-backed daemons from configuration.
    pub fn from_config(config: &PoolConfig) -> Self {
        let machines = config
            .hosts
            .iter()
            .map(|entry| {
                let daemon: Arc<dyn Daemon> = match &entry.ssh {
                    Some(target) => Arc::new(ShellDaemon::over_ssh(target, entry.endpoint.clone())),
                    None => Arc::new(ShellDaemon::local(entry.endpoint.clone())),
                };
                Machine {
                    id: MachineId::new(),
                    hostname: entry.hostname.clone(),
                    hardware_id: entry.hardware_id.clone(),
                    daemon,
                }
            })
            .collect();
        Self::new(machines)
    }

    pub async fn available(&self) -> usize {
        self.available.lock().await.len()
    }
}

#[async_trait]
impl MachineProvisioner for StaticPool {
    async fn obtain(&self, hardware_id: Option<&str>) -> FleetResult<Machine> {
        let mut available = self.available.lock().await;
        let position = match hardware_id {
            Some(wanted) => available
                .iter()
                .position(|m| m.hardware_id.as_deref() == Some(wanted))
                .or_else(|| (!available.is_empty()).then_some(0)),
            None => (!available.is_empty()).then_some(0),
        };

        let Some(machine) = position.and_then(|i| available.remove(i)) else {
            return Err(FleetError::NoMachinesAvailable(
                "static pool exhausted".to_string(),
            ));
        };

        info!(
            machine_id = %machine.id,
            hostname = %machine.hostname,
            remaining = available.len(),
            "Obtained machine from static pool"
        );
        self.in_use.lock().await.push(machine.clone());
        Ok(machine)
    }

    async fn release(&self, machine: &Machine) -> FleetResult<()> {
        let machine = {
            let mut in_use = self.in_use.lock().await;
            let Some(position) = in_use.iter().position(|m| m.id == machine.id) else {
                warn!(machine_id = %machine.id, "Machine already returned to pool");
                return Ok(());
            };
            in_use.remove(position)
        };
        info!(machine_id = %machine.id, hostname = %machine.hostname, "Returned machine to static pool");
        self.available.lock().await.push_back(machine);
        Ok(())
    }
}

// =============================================================================
// Mock provisioner
// =============================================================================

/// Provisioner handing out [`MockDaemon`] machines.
pub struct MockProvisioner {
    settings: MockDaemonSettings,
    capacity: Option<usize>,
    fail: bool,
    delay: Duration,
    daemons: Mutex<Vec<Arc<MockDaemon>>>,
    obtained: AtomicU64,
    released: AtomicU64,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self {
            settings: MockDaemonSettings::default(),
            capacity: None,
            fail: false,
            delay: Duration::ZERO,
            daemons: Mutex::new(Vec::new()),
            obtained: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// A provisioner that fails every request.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_settings(mut self, settings: MockDaemonSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Delay each obtain, to widen races in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Daemons handed out so far, in order.
    pub async fn daemons(&self) -> Vec<Arc<MockDaemon>> {
        self.daemons.lock().await.clone()
    }

    pub fn obtained(&self) -> u64 {
        self.obtained.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineProvisioner for MockProvisioner {
    async fn obtain(&self, hardware_id: Option<&str>) -> FleetResult<Machine> {
        if self.fail {
            return Err(FleetError::NoMachinesAvailable(
                "[MOCK] provisioner configured to fail".to_string(),
            ));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut daemons = self.daemons.lock().await;
        if self.capacity.is_some_and(|cap| daemons.len() >= cap) {
            return Err(FleetError::NoMachinesAvailable(format!(
                "[MOCK] capacity of {} machines reached",
                daemons.len()
            )));
        }

        let hostname = format!("mock-{}", daemons.len() + 1);
        let daemon = Arc::new(MockDaemon::with_settings(&hostname, self.settings.clone()));
        daemons.push(Arc::clone(&daemon));
        self.obtained.fetch_add(1, Ordering::SeqCst);
        info!(hostname = %hostname, "[MOCK] Provisioned machine");

        Ok(Machine {
            id: MachineId::new(),
            hostname,
            hardware_id: hardware_id.map(str::to_string),
            daemon,
        })
    }

    async fn release(&self, machine: &Machine) -> FleetResult<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        info!(hostname = %machine.hostname, "[MOCK] Released machine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(hostname: &str, hardware: Option<&str>) -> Machine {
        Machine {
            hardware_id: hardware.map(str::to_string),
            ..Machine::new(hostname, Arc::new(MockDaemon::new(hostname)))
        }
    }

    #[tokio::test]
    async fn test_static_pool_obtain_and_release() {
        let pool = StaticPool::new(vec![machine("a", None), machine("b", None)]);

        let first = pool.obtain(None).await.unwrap();
        assert_eq!(first.hostname, "a");
        let second = pool.obtain(None).await.unwrap();
        assert!(matches!(
            pool.obtain(None).await,
            Err(FleetError::NoMachinesAvailable(_))
        ));

        pool.release(&first).await.unwrap();
        pool.release(&first).await.unwrap();
        assert_eq!(pool.available().await, 1);
        pool.release(&second).await.unwrap();
        assert_eq!(pool.available().await, 2);
    }

    #[tokio::test]
    async fn test_static_pool_prefers_hardware_profile() {
        let pool = StaticPool::new(vec![machine("small", Some("m5.large")), machine("big", Some("m5.4xlarge"))]);
        let got = pool.obtain(Some("m5.4xlarge")).await.unwrap();
        assert_eq!(got.hostname, "big");
        let fallback = pool.obtain(Some("gpu")).await.unwrap();
        assert_eq!(fallback.hostname, "small");
    }

    #[tokio::test]
    async fn test_mock_provisioner_capacity() {
        let provisioner = MockProvisioner::new().with_capacity(1);
        provisioner.obtain(None).await.unwrap();
        assert!(provisioner.obtain(None).await.is_err());
        assert_eq!(provisioner.obtained(), 1);
        assert_eq!(provisioner.daemons().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_provisioner_failing() {
        let provisioner = MockProvisioner::failing();
        assert!(matches!(
            provisioner.obtain(None).await,
            Err(FleetError::NoMachinesAvailable(_))
        ));
    }
}
