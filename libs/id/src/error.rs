//! ID parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// A well-formed ID of another entity type, e.g. a container ID passed
    /// where a host ID was expected.
    #[error("expected a '{expected}' ID, got a '{found}' ID")]
    WrongKind {
        expected: &'static str,
        found: String,
    },

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Daemon output that is not a full object ID.
    #[error("invalid docker id '{value}': {reason}")]
    InvalidDockerId { value: String, reason: &'static str },
}
