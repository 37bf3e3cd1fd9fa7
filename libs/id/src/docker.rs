//! Daemon object IDs.
//!
//! The daemon reports container and image IDs as 64 hex characters,
//! sometimes behind a `sha256:` digest prefix. Anything else is rejected
//! outright; IDs are never truncated or padded to fit.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Length of a full daemon object ID.
pub const DOCKER_ID_LEN: usize = 64;

/// Length of the abbreviated form printed by `ps`.
pub const SHORT_ID_LEN: usize = 12;

/// A validated 64 character lowercase hex ID for a container or image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DockerId(String);

impl DockerId {
    /// Validates daemon output as an object ID.
    ///
    /// Surrounding whitespace is trimmed and the value is lowercased before
    /// validation. A leading `sha256:` digest prefix is accepted.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }

        let lowered = trimmed.to_ascii_lowercase();
        let hex = lowered.strip_prefix("sha256:").unwrap_or(&lowered);

        if hex.len() != DOCKER_ID_LEN {
            return Err(IdError::InvalidDockerId {
                value: trimmed.to_string(),
                reason: "expected 64 characters",
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdError::InvalidDockerId {
                value: trimmed.to_string(),
                reason: "expected hex characters",
            });
        }

        Ok(Self(hex.to_string()))
    }

    /// Returns the full ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the abbreviated form the daemon prints in listings.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_ID_LEN]
    }

    /// True when `candidate` is a non-empty prefix of this ID.
    pub fn matches_prefix(&self, candidate: &str) -> bool {
        !candidate.is_empty() && self.0.starts_with(&candidate.to_ascii_lowercase())
    }
}

impl fmt::Display for DockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DockerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for DockerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for DockerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DockerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
