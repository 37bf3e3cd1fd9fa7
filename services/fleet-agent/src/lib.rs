//! dockfleet Fleet Agent Library
//!
//! Turns a pool of docker-daemon machines into one elastic placement target.
//!
//! ## Architecture
//!
//! ```text
//! Infrastructure
//! └── ClusterAllocator          (placement, provisioning gate, cluster map)
//!     └── Host(id)              (membership, host lock, image latches)
//!         ├── allocator         (image resolution, run, install, commit)
//!         └── scanner           (periodic reconciliation with `ps`)
//! ```
//!
//! Daemons are driven through the [`daemon::Daemon`] trait: a process-backed
//! implementation shells out to the docker CLI, locally or over ssh, and
//! [`daemon::MockDaemon`] emulates one in memory for tests.
//!
//! ## Modules
//!
//! - `cluster`: placement strategies and the cluster allocator
//! - `host`: per-host allocation and reconciliation
//! - `image`: per-host image build latches
//! - `daemon`: the daemon command surface
//! - `location`: `docker:` location strings

pub mod callback;
pub mod cluster;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod firewall;
pub mod host;
pub mod image;
pub mod infrastructure;
pub mod location;
pub mod provision;
pub mod workload;

// Re-export commonly used types
pub use cluster::{ClusterAllocator, ClusterPolicy, PlacementStrategy, StrategyConfig};
pub use config::{Config, InfrastructureConfig};
pub use container::Container;
pub use error::{FleetError, FleetResult};
pub use host::{Host, ScanReport};
pub use infrastructure::Infrastructure;
pub use location::{LocationRegistry, LocationSpec, ResolvedLocation};
pub use provision::{Machine, MachineProvisioner, MockProvisioner, StaticPool};
pub use workload::{ImageSource, WorkloadSpec};
