//! Reconciling a host's membership set with what its daemon runs.

use std::sync::Arc;
use std::time::Duration;

use dockfleet_reconcile::{plan_scan, Lifecycle, Member};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::Host;
use crate::container::Container;
use crate::error::FleetResult;

/// What one scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub matched: usize,
    pub adopted: usize,
    pub retired: usize,
    pub marked_stopping: usize,
    pub skipped: usize,
}

impl ScanReport {
    pub fn is_noop(&self) -> bool {
        self.adopted == 0 && self.retired == 0 && self.marked_stopping == 0
    }
}

impl Host {
    /// Bring the membership set in line with the daemon's listing.
    ///
    /// Takes the host lock for write, so no allocation or release runs
    /// during a scan. If the listing cannot be read, membership is left
    /// untouched.
    #[instrument(skip(self), fields(host_id = %self.id))]
    pub async fn scan_containers(&self) -> FleetResult<ScanReport> {
        let _exclusive = self.lock.write().await;

        let live = self.docker.ps().await?;

        let members: Vec<Member<_>> = self
            .members
            .lock()
            .await
            .values()
            .map(|c| Member {
                key: c.id(),
                docker_id: c.docker_id().to_string(),
                lifecycle: c.lifecycle(),
            })
            .collect();

        let plan = plan_scan(&live, &members);
        let mut report = ScanReport {
            matched: plan.matched.len(),
            skipped: plan.skipped.len(),
            ..ScanReport::default()
        };

        for docker_id in &plan.adopt {
            match self.docker.inspect_container(docker_id).await {
                Ok(info) => {
                    let container = Arc::new(Container::adopt(self.id, self.hostname(), info));
                    info!(
                        container_id = %container.id(),
                        docker_id = %container.docker_id().short(),
                        image = %container.image_name(),
                        "Adopted running container"
                    );
                    self.members
                        .lock()
                        .await
                        .insert(container.id(), container);
                    report.adopted += 1;
                }
                Err(e) => {
                    warn!(docker_id = %docker_id, error = %e, "Failed to inspect listed container");
                }
            }
        }

        for key in &plan.retire {
            let removed = self.members.lock().await.remove(key);
            if let Some(container) = removed {
                container.close().await;
                debug!(container_id = %key, "Retired vanished container");
                report.retired += 1;
            }
        }

        for key in &plan.mark_stopping {
            if let Some(container) = self.members.lock().await.get(key) {
                container.set_lifecycle(Lifecycle::Stopping);
                report.marked_stopping += 1;
            }
        }

        self.sample_cpu_usage().await;

        if !report.is_noop() {
            info!(
                adopted = report.adopted,
                retired = report.retired,
                marked_stopping = report.marked_stopping,
                "Membership reconciled"
            );
        }
        Ok(report)
    }

    /// Refresh the CPU reading from the host's load average.
    async fn sample_cpu_usage(&self) {
        let output = match self
            .docker
            .host_shell("nproc && cut -d' ' -f1 /proc/loadavg")
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "CPU sample failed");
                return;
            }
        };

        match parse_cpu_sample(&output.stdout) {
            Some(usage) => self.record_cpu_usage(usage),
            None => debug!(stdout = %output.stdout.trim(), "Unreadable CPU sample"),
        }
    }
}

/// Load average over core count, from `nproc` then the 1-minute load.
fn parse_cpu_sample(stdout: &str) -> Option<f64> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let cores: f64 = lines.next()?.parse().ok()?;
    let load: f64 = lines.next()?.parse().ok()?;
    (cores > 0.0).then(|| load / cores)
}

/// Periodic scanner task for one host.
#[derive(Debug)]
pub(super) struct ScannerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    pub(super) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scanner task ended abnormally");
        }
    }
}

pub(super) fn spawn(host: Arc<Host>, interval: Duration) -> ScannerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the host was just probed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = host.scan_containers().await {
                        warn!(host_id = %host.id(), error = %e, "Membership scan failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(host_id = %host.id(), "Scanner stopped");
    });

    ScannerHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_sample() {
        assert_eq!(parse_cpu_sample("4\n2.00\n"), Some(0.5));
        assert_eq!(parse_cpu_sample("0\n1.0\n"), None);
        assert_eq!(parse_cpu_sample("garbage"), None);
        assert_eq!(parse_cpu_sample(""), None);
    }

    #[test]
    fn test_report_noop() {
        let report = ScanReport {
            matched: 3,
            skipped: 1,
            ..ScanReport::default()
        };
        assert!(report.is_noop());
        assert!(!ScanReport { adopted: 1, ..report }.is_noop());
    }
}
