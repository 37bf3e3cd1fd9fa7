//! Compact location strings for infrastructures and hosts.
//!
//! ```text
//! docker:<infraId>[:<hostId>][:(name=<name>[,displayName=<display>])]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dockfleet_id::{HostId, InfrastructureId};
use fancy_regex::Regex;
use tokio::sync::RwLock;

use crate::error::{FleetError, FleetResult};
use crate::host::Host;
use crate::infrastructure::Infrastructure;

const LOCATION_PATTERN: &str =
    r"^(docker|DOCKER):([A-Za-z0-9_]+)(?::([A-Za-z0-9_]+))?(?::\((.*)\))?$";

fn location_pattern() -> FleetResult<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(LOCATION_PATTERN).ok())
        .as_ref()
        .ok_or_else(|| FleetError::Config("location pattern failed to compile".to_string()))
}

/// A parsed location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    pub infrastructure: String,
    pub host: Option<String>,
    pub name: String,
    pub display_name: String,
}

impl LocationSpec {
    pub fn parse(raw: &str) -> FleetResult<Self> {
        let invalid = |why: &str| FleetError::InvalidArgument(format!("location {raw:?}: {why}"));

        let captures = location_pattern()?
            .captures(raw.trim())
            .map_err(|e| invalid(&e.to_string()))?
            .ok_or_else(|| invalid("expected docker:<infraId>[:<hostId>][:(args)]"))?;

        let infrastructure = captures
            .get(2)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| invalid("missing infrastructure id"))?;
        let host = captures.get(3).map(|m| m.as_str().to_string());

        let mut name = None;
        let mut display_name = None;
        if let Some(args) = captures.get(4) {
            for arg in args.as_str().split(',').map(str::trim) {
                let Some((key, value)) = arg.split_once('=') else {
                    return Err(invalid(&format!("argument {arg:?} is not key=value")));
                };
                let value = value.trim();
                if value.is_empty() {
                    return Err(invalid(&format!("argument {key:?} is empty")));
                }
                match key.trim() {
                    "name" => name = Some(value.to_string()),
                    "displayName" => display_name = Some(value.to_string()),
                    other => return Err(invalid(&format!("unknown argument {other:?}"))),
                }
            }
        }

        let name = name.unwrap_or_else(|| match &host {
            Some(host) => format!("docker-{infrastructure}-{host}"),
            None => format!("docker-{infrastructure}"),
        });
        let display_name = display_name.unwrap_or_else(|| match &host {
            Some(host) => format!("Docker Host {host}"),
            None => format!("Docker Infrastructure {infrastructure}"),
        });

        Ok(Self {
            infrastructure,
            host,
            name,
            display_name,
        })
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "docker:{}", self.infrastructure)?;
        if let Some(host) = &self.host {
            write!(f, ":{host}")?;
        }
        write!(f, ":(name={},displayName={})", self.name, self.display_name)
    }
}

/// What a location string refers to.
pub enum ResolvedLocation {
    Infrastructure {
        infrastructure: Arc<Infrastructure>,
        spec: LocationSpec,
    },
    Host {
        infrastructure: Arc<Infrastructure>,
        host: Arc<Host>,
        spec: LocationSpec,
    },
}

impl ResolvedLocation {
    pub fn spec(&self) -> &LocationSpec {
        match self {
            Self::Infrastructure { spec, .. } | Self::Host { spec, .. } => spec,
        }
    }

    pub fn infrastructure(&self) -> &Arc<Infrastructure> {
        match self {
            Self::Infrastructure { infrastructure, .. } | Self::Host { infrastructure, .. } => {
                infrastructure
            }
        }
    }
}

/// Known infrastructures, by ID.
#[derive(Debug, Default)]
pub struct LocationRegistry {
    infrastructures: RwLock<BTreeMap<InfrastructureId, Arc<Infrastructure>>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, infrastructure: Arc<Infrastructure>) {
        self.infrastructures
            .write()
            .await
            .insert(infrastructure.id(), infrastructure);
    }

    pub async fn unregister(&self, id: InfrastructureId) -> Option<Arc<Infrastructure>> {
        self.infrastructures.write().await.remove(&id)
    }

    pub async fn resolve(&self, raw: &str) -> FleetResult<ResolvedLocation> {
        let spec = LocationSpec::parse(raw)?;

        let infra_id = InfrastructureId::parse(&spec.infrastructure)
            .map_err(|e| FleetError::InvalidArgument(format!("location {raw:?}: {e}")))?;
        let infrastructure = self
            .infrastructures
            .read()
            .await
            .get(&infra_id)
            .cloned()
            .ok_or_else(|| {
                FleetError::InvalidArgument(format!("unknown infrastructure {infra_id}"))
            })?;

        let Some(host) = &spec.host else {
            return Ok(ResolvedLocation::Infrastructure {
                infrastructure,
                spec,
            });
        };

        let host_id = HostId::parse(host)
            .map_err(|e| FleetError::InvalidArgument(format!("location {raw:?}: {e}")))?;
        let host = infrastructure
            .cluster()
            .host(host_id)
            .await
            .ok_or_else(|| {
                FleetError::InvalidArgument(format!("unknown host {host_id} in {infra_id}"))
            })?;

        Ok(ResolvedLocation::Host {
            infrastructure,
            host,
            spec,
        })
    }
}
