//! Membership scans against a mock daemon changed behind the fleet's back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockfleet_agent::config::{HostConfig, InfrastructureConfig};
use dockfleet_agent::daemon::{CommandOutput, Daemon, MockDaemon, MockDaemonSettings};
use dockfleet_agent::{
    FleetError, FleetResult, Host, ImageSource, Infrastructure, Machine, WorkloadSpec,
};
use dockfleet_reconcile::Lifecycle;

/// Mock daemon whose `ps` can be made to fail.
#[derive(Debug)]
struct FlakyDaemon {
    inner: MockDaemon,
    fail_ps: AtomicBool,
}

#[async_trait]
impl Daemon for FlakyDaemon {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> FleetResult<CommandOutput> {
        if self.fail_ps.load(Ordering::SeqCst) && args.first().is_some_and(|v| v == "ps") {
            return Err(FleetError::Daemon("connection refused".to_string()));
        }
        self.inner.docker(args, timeout).await
    }

    async fn shell(&self, command: &str, timeout: Duration) -> FleetResult<CommandOutput> {
        self.inner.shell(command, timeout).await
    }
}

fn config(scan_interval_secs: u64) -> InfrastructureConfig {
    InfrastructureConfig {
        host: HostConfig {
            scan_interval_secs,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn worker(name: &str) -> WorkloadSpec {
    WorkloadSpec::new(name).with_image(ImageSource {
        base_image: Some("busybox".to_string()),
        ..Default::default()
    })
}

async fn single_host(
    daemon: Arc<dyn Daemon>,
    scan_interval_secs: u64,
) -> (Arc<Infrastructure>, Arc<Host>) {
    let infra = Arc::new(Infrastructure::new(&config(scan_interval_secs), None).unwrap());
    let host = infra
        .cluster()
        .register_machine(Machine::new("h1", daemon))
        .await
        .unwrap();
    (infra, host)
}

#[tokio::test]
async fn test_scan_adopts_and_retires() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (infra, host) = single_host(daemon.clone(), 0).await;

    let a = infra.obtain(&worker("a")).await.unwrap();
    let c = infra.obtain(&worker("c")).await.unwrap();

    // C stops and disappears; B appears.
    daemon.remove_external(c.docker_id()).await;
    c.set_lifecycle(Lifecycle::Stopped);
    let b = daemon.start_external("redis").await.unwrap();

    let report = host.scan_containers().await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.adopted, 1);
    assert_eq!(report.retired, 1);

    let members = host.members().await;
    assert_eq!(members.len(), 2);
    assert!(host.member(a.id()).await.is_some());
    assert!(host.member(c.id()).await.is_none());

    let adopted = members
        .iter()
        .find(|m| m.docker_id() == &b)
        .expect("B adopted");
    assert_eq!(adopted.lifecycle(), Lifecycle::Running);
    assert_eq!(adopted.image_name(), "redis:latest");
    assert!(adopted.record().workload_id.is_none());

    let again = host.scan_containers().await.unwrap();
    assert!(again.is_noop());
    assert_eq!(again.matched, 2);
    assert_eq!(host.members().await.len(), 2);
}

#[tokio::test]
async fn test_vanished_running_member_is_marked_then_retired() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (infra, host) = single_host(daemon.clone(), 0).await;

    let container = infra.obtain(&worker("a")).await.unwrap();
    daemon.remove_external(container.docker_id()).await;

    let first = host.scan_containers().await.unwrap();
    assert_eq!(first.marked_stopping, 1);
    assert_eq!(container.lifecycle(), Lifecycle::Stopping);
    assert!(host.member(container.id()).await.is_some());

    let second = host.scan_containers().await.unwrap();
    assert_eq!(second.retired, 1);
    assert!(host.member(container.id()).await.is_none());
    assert_eq!(container.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_unsettled_members_are_skipped() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (infra, host) = single_host(daemon.clone(), 0).await;

    let starting = infra.obtain(&worker("a")).await.unwrap();
    let on_fire = infra.obtain(&worker("b")).await.unwrap();
    daemon.remove_external(starting.docker_id()).await;
    daemon.remove_external(on_fire.docker_id()).await;
    starting.set_lifecycle(Lifecycle::Starting);
    on_fire.set_lifecycle(Lifecycle::OnFire);

    let report = host.scan_containers().await.unwrap();
    assert_eq!(report.skipped, 2);
    assert!(report.is_noop());
    assert_eq!(starting.lifecycle(), Lifecycle::Starting);
    assert_eq!(on_fire.lifecycle(), Lifecycle::OnFire);
    assert_eq!(host.members().await.len(), 2);
}

#[tokio::test]
async fn test_failed_listing_leaves_members_alone() {
    let daemon = Arc::new(FlakyDaemon {
        inner: MockDaemon::new("h1"),
        fail_ps: AtomicBool::new(false),
    });
    let (infra, host) = single_host(daemon.clone(), 0).await;
    let container = infra.obtain(&worker("a")).await.unwrap();

    daemon.fail_ps.store(true, Ordering::SeqCst);
    let result = host.scan_containers().await;
    assert!(matches!(result, Err(FleetError::Daemon(_))));

    assert_eq!(container.lifecycle(), Lifecycle::Running);
    assert!(host.member(container.id()).await.is_some());
}

#[tokio::test]
async fn test_scan_waits_for_allocation() {
    let daemon = Arc::new(MockDaemon::with_settings(
        "h1",
        MockDaemonSettings {
            build_delay: Duration::from_millis(300),
            ..Default::default()
        },
    ));
    let (infra, host) = single_host(daemon.clone(), 0).await;

    let allocation = tokio::spawn({
        let infra = Arc::clone(&infra);
        async move { infra.obtain(&worker("slow")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The allocation is pulling under the host read lock.
    let blocked = tokio::time::timeout(Duration::from_millis(100), host.scan_containers()).await;
    assert!(blocked.is_err());

    let container = allocation.await.unwrap().unwrap();
    let report = host.scan_containers().await.unwrap();
    assert_eq!(report.matched, 1);
    assert!(report.is_noop());
    assert!(host.member(container.id()).await.is_some());
}

#[tokio::test]
async fn test_adopted_members_release_at_host_level() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (infra, host) = single_host(daemon.clone(), 0).await;

    daemon.start_external("nginx").await.unwrap();
    host.scan_containers().await.unwrap();
    let adopted = host.members().await.remove(0);

    // The cluster never handed this container out.
    assert!(matches!(
        infra.release(&adopted).await,
        Err(FleetError::InvalidArgument(_))
    ));

    host.release_container(&adopted).await.unwrap();
    host.release_container(&adopted).await.unwrap();
    assert_eq!(host.container_count().await, 0);
    assert!(daemon.running().await.is_empty());
}

#[tokio::test]
async fn test_cpu_usage_sampled_during_scan() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (_infra, host) = single_host(daemon.clone(), 0).await;
    assert_eq!(host.cpu_usage(), None);

    daemon.set_shell_stdout("4\n1.00\n").await;
    host.scan_containers().await.unwrap();
    assert_eq!(host.cpu_usage(), Some(0.25));

    daemon.set_shell_stdout("not a sample").await;
    host.scan_containers().await.unwrap();
    assert_eq!(host.cpu_usage(), Some(0.25));
}

#[tokio::test]
async fn test_periodic_scanner_stops_with_host() {
    let daemon = Arc::new(MockDaemon::new("h1"));
    let (_infra, host) = single_host(daemon.clone(), 1).await;

    daemon.start_external("nginx").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(host.container_count().await, 1);

    host.stop().await.unwrap();
    host.stop().await.unwrap();
    assert_eq!(host.lifecycle(), Lifecycle::Stopped);
    assert_eq!(host.container_count().await, 0);
}
