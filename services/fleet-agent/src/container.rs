//! Containers owned by a host.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dockfleet_id::{AppId, ContainerId, DockerId, HostId, WorkloadId};
use dockfleet_reconcile::Lifecycle;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

use crate::daemon::ContainerInfo;
use crate::image::ImageLatch;

/// Everything known about a container when it is first registered.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub host_id: HostId,
    pub name: String,
    pub docker_id: DockerId,
    pub image_name: String,
    pub image_id: Option<DockerId>,
    pub workload_id: Option<WorkloadId>,
    pub application_id: Option<AppId>,
    pub parent_id: Option<WorkloadId>,
    pub hardware_id: Option<String>,
    pub port_bindings: BTreeMap<u16, u16>,
    pub volumes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub addresses: Vec<String>,
}

/// One container on one host.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    record: ContainerRecord,
    created_at: DateTime<Utc>,
    image_id: RwLock<Option<DockerId>>,
    lifecycle: watch::Sender<Lifecycle>,
    /// Latch counted down by the commit callback.
    pending_commit: Mutex<Option<ImageLatch>>,
}

impl Container {
    /// A container the host is creating.
    pub fn new(record: ContainerRecord, pending_commit: Option<ImageLatch>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        Self {
            id: ContainerId::new(),
            image_id: RwLock::new(record.image_id.clone()),
            record,
            created_at: Utc::now(),
            lifecycle,
            pending_commit: Mutex::new(pending_commit),
        }
    }

    /// Rehydrate a container found on the daemon without going through
    /// install.
    pub fn adopt(host_id: HostId, hostname: &str, info: ContainerInfo) -> Self {
        let mut addresses = vec![hostname.to_string()];
        addresses.extend(info.ip_address.clone().filter(|ip| !ip.is_empty()));

        let record = ContainerRecord {
            host_id,
            name: format!("adopted-{}", info.id.short()),
            docker_id: info.id,
            image_name: info.image_name,
            image_id: Some(info.image_id),
            workload_id: None,
            application_id: None,
            parent_id: None,
            hardware_id: None,
            port_bindings: BTreeMap::new(),
            volumes: BTreeMap::new(),
            env: BTreeMap::new(),
            addresses,
        };

        let container = Self::new(record, None);
        container.set_lifecycle(if info.running {
            Lifecycle::Running
        } else {
            Lifecycle::Stopped
        });
        container
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn host_id(&self) -> HostId {
        self.record.host_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn docker_id(&self) -> &DockerId {
        &self.record.docker_id
    }

    pub fn image_name(&self) -> &str {
        &self.record.image_name
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whole seconds since the container was registered.
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }

    pub async fn image_id(&self) -> Option<DockerId> {
        self.image_id.read().await.clone()
    }

    pub async fn set_image_id(&self, id: DockerId) {
        *self.image_id.write().await = Some(id);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn set_lifecycle(&self, next: Lifecycle) {
        let previous = self.lifecycle.send_replace(next);
        if previous != next {
            debug!(
                container_id = %self.id,
                from = %previous,
                to = %next,
                "Container lifecycle changed"
            );
        }
    }

    /// Take the commit latch, leaving none behind.
    pub async fn take_pending_commit(&self) -> Option<ImageLatch> {
        self.pending_commit.lock().await.take()
    }

    /// Mark the container stopped and drop any outstanding commit latch.
    pub async fn close(&self) {
        self.take_pending_commit().await;
        self.set_lifecycle(Lifecycle::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(running: bool) -> ContainerInfo {
        ContainerInfo {
            id: DockerId::parse(&"a".repeat(64)).unwrap(),
            image_id: DockerId::parse(&"b".repeat(64)).unwrap(),
            image_name: "busybox:latest".into(),
            running,
            ip_address: Some("172.17.0.4".into()),
        }
    }

    #[test]
    fn test_adopt_running_container() {
        let host_id = HostId::new();
        let container = Container::adopt(host_id, "node-1", info(true));
        assert_eq!(container.host_id(), host_id);
        assert_eq!(container.lifecycle(), Lifecycle::Running);
        assert_eq!(container.record().addresses, vec!["node-1", "172.17.0.4"]);
        assert_eq!(container.image_name(), "busybox:latest");
        assert!(container.created_at() <= Utc::now());
        assert_eq!(container.uptime_secs(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_commit_latch() {
        let cache = crate::image::ImageCache::new(Default::default());
        let latch = cache.open("web").await.unwrap();
        let container = Container::adopt(HostId::new(), "node-1", info(true));
        *container.pending_commit.lock().await = Some(latch);

        assert!(cache.is_pending("web").await);
        container.close().await;
        assert!(!cache.is_pending("web").await);
        assert_eq!(container.lifecycle(), Lifecycle::Stopped);
    }
}
