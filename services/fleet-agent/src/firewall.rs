//! Inbound firewall rules for bound ports.
//!
//! Rules are shared by every host of an infrastructure; callers serialize
//! updates with the infrastructure's firewall lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::daemon::DockerCli;
use crate::error::FleetResult;

/// Opens inbound TCP ports for a host.
#[async_trait]
pub trait Firewall: Send + Sync + fmt::Debug {
    async fn authorize(
        &self,
        hostname: &str,
        docker: &DockerCli,
        ports: &BTreeSet<u16>,
    ) -> FleetResult<()>;
}

/// Firewall that changes nothing.
#[derive(Debug, Default)]
pub struct NoopFirewall;

#[async_trait]
impl Firewall for NoopFirewall {
    async fn authorize(
        &self,
        _hostname: &str,
        _docker: &DockerCli,
        _ports: &BTreeSet<u16>,
    ) -> FleetResult<()> {
        Ok(())
    }
}

/// A named rule set shared across hosts, optionally mirrored into each
/// host's iptables.
#[derive(Debug)]
pub struct SecurityGroup {
    name: String,
    open_iptables: bool,
    rules: Mutex<BTreeSet<u16>>,
    host_rules: Mutex<BTreeMap<String, BTreeSet<u16>>>,
}

impl SecurityGroup {
    pub fn new(name: impl Into<String>, open_iptables: bool) -> Self {
        Self {
            name: name.into(),
            open_iptables,
            rules: Mutex::new(BTreeSet::new()),
            host_rules: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ports currently allowed by the group.
    pub async fn rules(&self) -> BTreeSet<u16> {
        self.rules.lock().await.clone()
    }
}

/// Rule that accepts inbound TCP on `port`, inserted only if absent.
fn iptables_rule(port: u16) -> String {
    format!(
        "iptables -C INPUT -p tcp --dport {port} -j ACCEPT 2>/dev/null || \
         iptables -I INPUT -p tcp --dport {port} -j ACCEPT"
    )
}

#[async_trait]
impl Firewall for SecurityGroup {
    async fn authorize(
        &self,
        hostname: &str,
        docker: &DockerCli,
        ports: &BTreeSet<u16>,
    ) -> FleetResult<()> {
        {
            let mut rules = self.rules.lock().await;
            let added: Vec<u16> = ports.difference(&rules).copied().collect();
            if !added.is_empty() {
                rules.extend(&added);
                info!(group = %self.name, ports = ?added, "Opened inbound ports");
            }
        }

        if self.open_iptables {
            let mut host_rules = self.host_rules.lock().await;
            let opened = host_rules.entry(hostname.to_string()).or_default();
            for port in ports.difference(&opened.clone()) {
                docker.host_shell(&iptables_rule(*port)).await?;
                opened.insert(*port);
                info!(hostname, port, "Opened iptables port");
            }
        }

        Ok(())
    }
}
