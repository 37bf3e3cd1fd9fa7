//! # dockfleet-id
//!
//! Typed identifiers for fleet entities, plus validation for the opaque
//! object IDs the container daemon hands back.
//!
//! ## ID Format
//!
//! Fleet entity IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `infra_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `host_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `ctr_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Daemon object IDs (containers, images) are a separate type,
//! [`DockerId`], which is always 64 lowercase hex characters.

mod docker;
mod error;
#[doc(hidden)]
pub mod macros;
mod types;

pub use docker::DockerId;
pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
