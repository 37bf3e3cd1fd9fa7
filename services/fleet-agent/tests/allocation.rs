//! Placement, provisioning, and release across a mock fleet.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dockfleet_agent::config::{HostConfig, InfrastructureConfig};
use dockfleet_agent::daemon::MockDaemonSettings;
use dockfleet_agent::firewall::SecurityGroup;
use dockfleet_agent::{
    FleetError, ImageSource, Infrastructure, MachineProvisioner, MockProvisioner, WorkloadSpec,
};
use dockfleet_reconcile::Lifecycle;

fn config() -> InfrastructureConfig {
    InfrastructureConfig {
        host: HostConfig {
            scan_interval_secs: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn config_with_cap(max_containers: usize) -> InfrastructureConfig {
    let mut config = config();
    config.host.max_containers = max_containers;
    config
}

fn pulled(name: &str) -> WorkloadSpec {
    WorkloadSpec::new(name).with_image(ImageSource {
        base_image: Some("busybox".to_string()),
        ..Default::default()
    })
}

fn built(image_name: &str) -> WorkloadSpec {
    WorkloadSpec::new("web").with_image(ImageSource {
        image_name: Some(image_name.to_string()),
        dockerfile_url: Some("https://example.invalid/Dockerfile".to_string()),
        ..Default::default()
    })
}

async fn infrastructure(
    config: &InfrastructureConfig,
    provisioner: &Arc<MockProvisioner>,
) -> Infrastructure {
    let provisioner: Arc<dyn MachineProvisioner> = Arc::clone(provisioner) as Arc<dyn MachineProvisioner>;
    let infra = Infrastructure::new(config, Some(provisioner)).unwrap();
    infra.start().await.unwrap();
    infra
}

#[tokio::test]
async fn test_obtain_release_round_trip() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config(), &provisioner).await;
    let cluster = infra.cluster();
    assert_eq!(cluster.hosts().await.len(), 1);

    let before = cluster.tracked().await;
    let host = cluster.hosts().await.remove(0);
    let members_before = host.container_count().await;

    let container = infra.obtain(&pulled("worker")).await.unwrap();
    assert_eq!(container.host_id(), host.id());
    assert_eq!(container.lifecycle(), Lifecycle::Running);
    assert!(cluster.tracked().await[&host.id()].contains(&container.id()));
    assert_eq!(host.container_count().await, members_before + 1);
    assert!(container.record().addresses.contains(&"mock-1".to_string()));

    infra.release(&container).await.unwrap();
    assert_eq!(cluster.tracked().await, before);
    assert_eq!(host.container_count().await, members_before);
    assert_eq!(container.lifecycle(), Lifecycle::Stopped);
    assert_eq!(provisioner.obtained(), 1);
}

#[tokio::test]
async fn test_provisions_when_hosts_are_full() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config_with_cap(1), &provisioner).await;

    let first = infra.obtain(&pulled("a")).await.unwrap();
    let second = infra.obtain(&pulled("b")).await.unwrap();

    assert_ne!(first.host_id(), second.host_id());
    assert_eq!(infra.cluster().hosts().await.len(), 2);
    assert_eq!(provisioner.obtained(), 2);
}

#[tokio::test]
async fn test_first_fit_is_deterministic() {
    let provisioner = Arc::new(MockProvisioner::new());
    let mut config = config();
    config.min_hosts = 3;
    let infra = infrastructure(&config, &provisioner).await;
    let first_host = infra.cluster().hosts().await[0].id();

    for name in ["a", "b", "c"] {
        let container = infra.obtain(&pulled(name)).await.unwrap();
        assert_eq!(container.host_id(), first_host);
    }
}

#[tokio::test]
async fn test_no_provisioner_is_resource_unavailable() {
    let infra = Infrastructure::new(&config(), None).unwrap();
    infra.start().await.unwrap();

    let result = infra.obtain(&pulled("worker")).await;
    assert!(matches!(result, Err(FleetError::ResourceUnavailable(_))));
}

#[tokio::test]
async fn test_provisioning_failure_is_no_machines_available() {
    let provisioner: Arc<dyn MachineProvisioner> = Arc::new(MockProvisioner::failing());
    let infra = Infrastructure::new(&config(), Some(provisioner)).unwrap();

    let result = infra.obtain(&pulled("worker")).await;
    assert!(matches!(result, Err(FleetError::NoMachinesAvailable(_))));
}

#[tokio::test]
async fn test_release_twice_is_a_noop() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config(), &provisioner).await;

    let container = infra.obtain(&pulled("worker")).await.unwrap();
    infra.release(&container).await.unwrap();
    let after_first = infra.cluster().tracked().await;

    infra.release(&container).await.unwrap();
    assert_eq!(infra.cluster().tracked().await, after_first);

    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("stop").await, 1);
}

#[tokio::test]
async fn test_concurrent_double_release_stops_once() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config(), &provisioner).await;

    let container = infra.obtain(&pulled("worker")).await.unwrap();
    let (first, second) = tokio::join!(infra.release(&container), infra.release(&container));
    first.unwrap();
    second.unwrap();

    assert_eq!(container.lifecycle(), Lifecycle::Stopped);
    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("stop").await, 1);
}

#[tokio::test]
async fn test_release_after_shutdown_is_a_noop() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config(), &provisioner).await;

    let container = infra.obtain(&pulled("worker")).await.unwrap();
    infra.shutdown().await.unwrap();
    assert_eq!(container.lifecycle(), Lifecycle::Stopped);

    infra.release(&container).await.unwrap();
    assert!(infra.cluster().tracked().await.is_empty());
}

#[tokio::test]
async fn test_stop_failure_falls_back_to_kill() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        failing_verbs: BTreeSet::from(["stop".to_string()]),
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;

    let container = infra.obtain(&pulled("worker")).await.unwrap();
    infra.release(&container).await.unwrap();

    assert_eq!(container.lifecycle(), Lifecycle::Stopped);
    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("kill").await, 1);
}

#[tokio::test]
async fn test_release_of_foreign_handle_is_invalid() {
    let ours = infrastructure(&config(), &Arc::new(MockProvisioner::new())).await;
    let theirs = infrastructure(&config(), &Arc::new(MockProvisioner::new())).await;

    let foreign = theirs.obtain(&pulled("worker")).await.unwrap();
    let result = ours.release(&foreign).await;
    assert!(matches!(result, Err(FleetError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_empty_hosts_removed_but_never_the_last() {
    let provisioner = Arc::new(MockProvisioner::new());
    let mut config = config_with_cap(1);
    config.remove_empty_hosts = true;
    let infra = infrastructure(&config, &provisioner).await;

    let a = infra.obtain(&pulled("a")).await.unwrap();
    let b = infra.obtain(&pulled("b")).await.unwrap();
    assert_eq!(infra.cluster().hosts().await.len(), 2);

    infra.release(&b).await.unwrap();
    let hosts = infra.cluster().hosts().await;
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id(), a.host_id());
    assert_eq!(provisioner.released(), 1);

    infra.release(&a).await.unwrap();
    assert_eq!(infra.cluster().hosts().await.len(), 1);
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_empty_hosts_kept_without_policy() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config_with_cap(1), &provisioner).await;

    let _a = infra.obtain(&pulled("a")).await.unwrap();
    let b = infra.obtain(&pulled("b")).await.unwrap();
    infra.release(&b).await.unwrap();

    assert_eq!(infra.cluster().hosts().await.len(), 2);
    assert_eq!(provisioner.released(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_build() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        build_delay: Duration::from_millis(50),
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;
    let workload = built("acme/foo:latest");

    let (a, b) = tokio::join!(infra.obtain(&workload), infra.obtain(&workload));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.image_name(), "acme/foo");
    assert_eq!(b.image_name(), "acme/foo");

    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("build").await, 1);
    assert_eq!(daemon.count("tag").await, 1);
    assert_eq!(daemon.count("commit").await, 1);
    assert!(daemon.has_image("acme/foo").await);
}

#[tokio::test]
async fn test_cached_image_skips_install() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config(), &provisioner).await;
    let workload = built("acme/bar").with_install("make install");

    infra.obtain(&workload).await.unwrap();
    infra.obtain(&workload).await.unwrap();

    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("build").await, 1);
    assert_eq!(daemon.count("exec").await, 1);
    assert_eq!(daemon.count("commit").await, 1);
}

#[tokio::test]
async fn test_failed_install_is_not_reused() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        failing_verbs: BTreeSet::from(["exec".to_string()]),
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;
    let workload = built("acme/unfinished").with_install("make install");

    let first = infra.obtain(&workload).await;
    assert!(matches!(first, Err(FleetError::BuildFailure { .. })));
    let host = infra.cluster().hosts().await.remove(0);
    assert!(host.images().is_abandoned("acme/unfinished").await);

    // The tag from the failed build is still there, but must be rebuilt
    // and installed rather than handed out.
    let second = infra.obtain(&workload).await;
    assert!(matches!(second, Err(FleetError::BuildFailure { .. })));

    let daemon = &provisioner.daemons().await[0];
    assert!(daemon.has_image("acme/unfinished").await);
    assert_eq!(daemon.count("build").await, 2);
    assert_eq!(daemon.count("exec").await, 2);
    assert_eq!(daemon.count("commit").await, 0);
    assert_eq!(host.container_count().await, 0);
}

#[tokio::test]
async fn test_malformed_image_id_is_parse_failure() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        malformed_image_ids: true,
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;

    let result = infra.obtain(&pulled("worker")).await;
    assert!(matches!(result, Err(FleetError::ParseFailure(_))));

    let host = infra.cluster().hosts().await.remove(0);
    assert_eq!(host.container_count().await, 0);
}

#[tokio::test]
async fn test_failed_setup_removes_container() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        failing_verbs: BTreeSet::from(["commit".to_string()]),
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;

    let result = infra.obtain(&built("acme/broken")).await;
    assert!(matches!(result, Err(FleetError::BuildFailure { .. })));

    let daemon = &provisioner.daemons().await[0];
    assert_eq!(daemon.count("rm").await, 1);
    assert!(daemon.running().await.is_empty());
    let host = infra.cluster().hosts().await.remove(0);
    assert_eq!(host.container_count().await, 0);
    assert!(!host.images().is_pending("acme/broken").await);
}

#[tokio::test]
async fn test_bound_ports_open_firewall() {
    let provisioner = Arc::new(MockProvisioner::new());
    let mut config = config();
    config.host.open_iptables = true;
    let group = Arc::new(SecurityGroup::new("web", true));
    let infra = Infrastructure::with_firewall(
        &config,
        Some(Arc::clone(&provisioner) as Arc<dyn MachineProvisioner>),
        Arc::clone(&group) as Arc<dyn dockfleet_agent::firewall::Firewall>,
    )
    .unwrap();
    infra.start().await.unwrap();

    let workload = pulled("web").with_port_binding(8080, 80);
    infra.obtain(&workload).await.unwrap();

    assert_eq!(group.rules().await, BTreeSet::from([8080]));
    let daemon = &provisioner.daemons().await[0];
    assert!(daemon
        .shell_commands()
        .await
        .iter()
        .any(|cmd| cmd.contains("--dport 8080")));
}

#[tokio::test]
async fn test_shutdown_releases_every_machine() {
    let provisioner = Arc::new(MockProvisioner::new());
    let infra = infrastructure(&config_with_cap(1), &provisioner).await;
    infra.obtain(&pulled("a")).await.unwrap();
    infra.obtain(&pulled("b")).await.unwrap();

    infra.shutdown().await.unwrap();
    infra.shutdown().await.unwrap();

    assert!(infra.cluster().hosts().await.is_empty());
    assert_eq!(provisioner.released(), 2);
}

#[tokio::test]
async fn test_shutdown_during_obtain_hands_out_nothing() {
    let provisioner = Arc::new(MockProvisioner::new().with_settings(MockDaemonSettings {
        build_delay: Duration::from_millis(300),
        ..Default::default()
    }));
    let infra = infrastructure(&config(), &provisioner).await;

    let image = pulled("worker");
    let (obtained, shutdown) = tokio::join!(infra.obtain(&image), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        infra.shutdown().await
    });
    shutdown.unwrap();

    assert!(matches!(obtained, Err(FleetError::ResourceUnavailable(_))));
    assert!(infra.cluster().tracked().await.is_empty());
    assert!(infra.cluster().hosts().await.is_empty());
    let daemon = &provisioner.daemons().await[0];
    assert!(daemon.running().await.is_empty());
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_concurrent_obtains_provision_one_host() {
    let provisioner = Arc::new(MockProvisioner::new().with_delay(Duration::from_millis(100)));
    let mut config = config();
    config.min_hosts = 0;
    let infra = infrastructure(&config, &provisioner).await;
    assert!(infra.cluster().hosts().await.is_empty());

    let workload = pulled("worker");
    let (a, b, c) = tokio::join!(
        infra.obtain(&workload),
        infra.obtain(&workload),
        infra.obtain(&workload)
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(provisioner.obtained(), 1);
    assert_eq!(infra.cluster().hosts().await.len(), 1);
    assert_eq!(a.host_id(), b.host_id());
    assert_eq!(b.host_id(), c.host_id());

    let stats = infra.cluster().stats();
    assert_eq!(stats.provisioned.load(Ordering::Relaxed), 1);
    assert_eq!(stats.contended.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_losing_the_gate_past_max_retries_is_resource_unavailable() {
    let provisioner = Arc::new(MockProvisioner::new().with_delay(Duration::from_millis(100)));
    let mut config = config();
    config.min_hosts = 0;
    config.placement.max_retries = 0;
    let infra = infrastructure(&config, &provisioner).await;

    let workload = pulled("worker");
    let (winner, loser) = tokio::join!(infra.obtain(&workload), infra.obtain(&workload));

    winner.unwrap();
    assert!(matches!(loser, Err(FleetError::ResourceUnavailable(_))));
    assert_eq!(provisioner.obtained(), 1);
    assert_eq!(infra.cluster().stats().contended.load(Ordering::Relaxed), 1);
}
