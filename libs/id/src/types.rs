//! Fleet entity IDs.

use crate::define_ids;

define_ids! {
    /// One infrastructure; survives restarts when pinned in configuration.
    InfrastructureId => "infra",
    /// A host inside an infrastructure.
    HostId => "host",
    /// A machine handed out by a provisioner.
    MachineId => "mach",
    /// A container tracked by a host. Distinct from the daemon's own
    /// object ID.
    ContainerId => "ctr",
    WorkloadId => "wl",
    AppId => "app",
}
