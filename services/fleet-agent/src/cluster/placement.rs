//! Placement strategies.
//!
//! A strategy narrows an ordered list of candidate hosts. Strategies are
//! chained: each one sees the previous stage's output, so the chain order
//! matters. The first host left standing receives the container.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dockfleet_id::{AppId, HostId, WorkloadId};
use dockfleet_reconcile::Lifecycle;
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FleetError, FleetResult};
use crate::workload::WorkloadSpec;

/// Default container cap per host.
pub const DEFAULT_MAX_CONTAINERS: usize = 8;

/// Default CPU usage ceiling, as a fraction of capacity.
pub const DEFAULT_MAX_CPU: f64 = 0.5;

/// Point-in-time view of a host, as seen by strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    pub host_id: HostId,
    pub hostname: String,
    pub lifecycle: Lifecycle,
    pub container_count: usize,
    pub cpu_usage: Option<f64>,
    /// Workloads running on the host.
    pub workloads: BTreeSet<WorkloadId>,
    /// Parents of workloads running on the host.
    pub parents: BTreeSet<WorkloadId>,
    /// Applications with a container on the host.
    pub applications: BTreeSet<AppId>,
}

/// A filter, with optional ordering, over candidate hosts.
pub trait PlacementStrategy: Send + Sync + fmt::Debug {
    /// Registry identifier.
    fn id(&self) -> &'static str;

    /// Ordering applied before filtering. The sort is stable.
    fn compare(&self, _a: &HostSnapshot, _b: &HostSnapshot) -> Ordering {
        Ordering::Equal
    }

    fn accepts(&self, _host: &HostSnapshot, _workload: &WorkloadSpec) -> bool {
        true
    }

    fn apply(&self, mut candidates: Vec<HostSnapshot>, workload: &WorkloadSpec) -> Vec<HostSnapshot> {
        candidates.sort_by(|a, b| self.compare(a, b));
        candidates.retain(|host| self.accepts(host, workload));
        candidates
    }
}

/// Run `candidates` through each strategy in turn.
pub fn narrow<'a, I>(
    mut candidates: Vec<HostSnapshot>,
    strategies: I,
    workload: &WorkloadSpec,
) -> Vec<HostSnapshot>
where
    I: IntoIterator<Item = &'a Arc<dyn PlacementStrategy>>,
{
    for strategy in strategies {
        let before = candidates.len();
        candidates = strategy.apply(candidates, workload);
        debug!(
            strategy = strategy.id(),
            before,
            after = candidates.len(),
            workload = %workload.name,
            "Placement narrowed"
        );
        if candidates.is_empty() {
            break;
        }
    }
    candidates
}

// =============================================================================
// Strategies
// =============================================================================

/// Fill hosts in registration order.
#[derive(Debug, Default)]
pub struct DepthFirst;

impl PlacementStrategy for DepthFirst {
    fn id(&self) -> &'static str {
        "depth-first"
    }
}

/// Spread across hosts, emptiest first, optionally capped.
#[derive(Debug, Default)]
pub struct BreadthFirst {
    pub max: Option<usize>,
}

impl PlacementStrategy for BreadthFirst {
    fn id(&self) -> &'static str {
        "breadth-first"
    }

    fn compare(&self, a: &HostSnapshot, b: &HostSnapshot) -> Ordering {
        a.container_count.cmp(&b.container_count)
    }

    fn accepts(&self, host: &HostSnapshot, _workload: &WorkloadSpec) -> bool {
        self.max.is_none_or(|max| host.container_count < max)
    }
}

/// Emptiest host first.
#[derive(Debug, Default)]
pub struct LeastContainers;

impl PlacementStrategy for LeastContainers {
    fn id(&self) -> &'static str {
        "least-containers"
    }

    fn compare(&self, a: &HostSnapshot, b: &HostSnapshot) -> Ordering {
        a.container_count.cmp(&b.container_count)
    }
}

/// Reject hosts at their container cap.
#[derive(Debug)]
pub struct MaxContainers {
    pub max: usize,
}

impl Default for MaxContainers {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_CONTAINERS,
        }
    }
}

impl PlacementStrategy for MaxContainers {
    fn id(&self) -> &'static str {
        "max-containers"
    }

    fn accepts(&self, host: &HostSnapshot, _workload: &WorkloadSpec) -> bool {
        host.container_count < self.max
    }
}

/// Reject hosts that are not running or are too busy.
///
/// A host without a CPU reading is rejected.
#[derive(Debug)]
pub struct MaxCpuUsage {
    pub max: f64,
}

impl Default for MaxCpuUsage {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_CPU,
        }
    }
}

impl PlacementStrategy for MaxCpuUsage {
    fn id(&self) -> &'static str {
        "max-cpu"
    }

    fn accepts(&self, host: &HostSnapshot, _workload: &WorkloadSpec) -> bool {
        host.lifecycle == Lifecycle::Running && host.cpu_usage.is_some_and(|cpu| cpu < self.max)
    }
}

/// Keep hosts whose hostname fully matches a pattern.
#[derive(Debug)]
pub struct HostnamePattern {
    pattern: Regex,
}

impl HostnamePattern {
    pub fn new(pattern: &str) -> FleetResult<Self> {
        let anchored = format!("^(?:{pattern})$");
        let pattern = Regex::new(&anchored)
            .map_err(|e| FleetError::Config(format!("hostname pattern '{pattern}': {e}")))?;
        Ok(Self { pattern })
    }
}

impl PlacementStrategy for HostnamePattern {
    fn id(&self) -> &'static str {
        "hostname"
    }

    fn accepts(&self, host: &HostSnapshot, _workload: &WorkloadSpec) -> bool {
        self.pattern.is_match(&host.hostname).unwrap_or(false)
    }
}

/// Co-locate siblings and keep applications apart.
///
/// A workload whose parent already has containers on some host goes to
/// those hosts. Otherwise hosts already running the same application are
/// dropped. With `exclusive`, hosts running anything at all are dropped
/// too.
#[derive(Debug, Default)]
pub struct Group {
    pub exclusive: bool,
}

impl PlacementStrategy for Group {
    fn id(&self) -> &'static str {
        "group"
    }

    fn apply(&self, candidates: Vec<HostSnapshot>, workload: &WorkloadSpec) -> Vec<HostSnapshot> {
        if let Some(parent) = &workload.parent_id {
            let siblings: Vec<HostSnapshot> = candidates
                .iter()
                .filter(|h| h.parents.contains(parent) || h.workloads.contains(parent))
                .cloned()
                .collect();
            if !siblings.is_empty() {
                return siblings;
            }
        }

        candidates
            .into_iter()
            .filter(|h| {
                workload
                    .application_id
                    .is_none_or(|app| !h.applications.contains(&app))
            })
            .filter(|h| !self.exclusive || h.container_count == 0)
            .collect()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Configured strategy, keyed by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyConfig {
    DepthFirst,
    BreadthFirst {
        #[serde(default)]
        max: Option<usize>,
    },
    LeastContainers,
    /// Without `max`, the host container cap applies.
    MaxContainers {
        #[serde(default)]
        max: Option<usize>,
    },
    MaxCpu {
        #[serde(default = "default_max_cpu")]
        max: f64,
    },
    Hostname {
        pattern: String,
    },
    Group {
        #[serde(default)]
        exclusive: bool,
    },
}

fn default_max_cpu() -> f64 {
    DEFAULT_MAX_CPU
}

impl StrategyConfig {
    /// Parse `id` or `id=value` into a strategy with default parameters.
    ///
    /// The value is the cap for `breadth-first` and `max-containers`, the
    /// ceiling for `max-cpu`, the pattern for `hostname`, and `exclusive`
    /// for `group`.
    pub fn from_id(spec: &str) -> FleetResult<Self> {
        let (id, value) = match spec.trim().split_once('=') {
            Some((id, value)) => (id.trim(), Some(value.trim())),
            None => (spec.trim(), None),
        };

        let bad_value = |value: &str| {
            FleetError::Config(format!("strategy '{id}' cannot take value '{value}'"))
        };
        let count = |value: Option<&str>| -> FleetResult<Option<usize>> {
            value
                .map(|v| v.parse::<usize>().map_err(|_| bad_value(v)))
                .transpose()
        };

        Ok(match id {
            "depth-first" => Self::DepthFirst,
            "breadth-first" => Self::BreadthFirst { max: count(value)? },
            "least-containers" => Self::LeastContainers,
            "max-containers" => Self::MaxContainers { max: count(value)? },
            "max-cpu" => Self::MaxCpu {
                max: value
                    .map(|v| v.parse::<f64>().map_err(|_| bad_value(v)))
                    .transpose()?
                    .unwrap_or(DEFAULT_MAX_CPU),
            },
            "hostname" => Self::Hostname {
                pattern: value
                    .ok_or_else(|| FleetError::Config("strategy 'hostname' needs a pattern".into()))?
                    .to_string(),
            },
            "group" => Self::Group {
                exclusive: matches!(value, Some("exclusive") | Some("true")),
            },
            other => {
                return Err(FleetError::Config(format!(
                    "unknown placement strategy '{other}'"
                )))
            }
        })
    }

    /// Resolve into a strategy instance.
    pub fn build(&self, default_max_containers: usize) -> FleetResult<Arc<dyn PlacementStrategy>> {
        Ok(match self {
            Self::DepthFirst => Arc::new(DepthFirst),
            Self::BreadthFirst { max } => Arc::new(BreadthFirst { max: *max }),
            Self::LeastContainers => Arc::new(LeastContainers),
            Self::MaxContainers { max } => Arc::new(MaxContainers {
                max: max.unwrap_or(default_max_containers),
            }),
            Self::MaxCpu { max } => Arc::new(MaxCpuUsage { max: *max }),
            Self::Hostname { pattern } => Arc::new(HostnamePattern::new(pattern)?),
            Self::Group { exclusive } => Arc::new(Group {
                exclusive: *exclusive,
            }),
        })
    }
}

/// Parse a comma-separated strategy list such as `max-containers=4,breadth-first`.
pub fn parse_strategy_list(list: &str) -> FleetResult<Vec<StrategyConfig>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(StrategyConfig::from_id)
        .collect()
}

/// Resolve a configured chain, preserving order.
pub fn build_chain(
    configs: &[StrategyConfig],
    default_max_containers: usize,
) -> FleetResult<Vec<Arc<dyn PlacementStrategy>>> {
    configs
        .iter()
        .map(|c| c.build(default_max_containers))
        .collect()
}
