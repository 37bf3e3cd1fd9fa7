//! ID type generation.
//!
//! Every fleet entity ID is the same shape, `{prefix}_{ulid}`, so the
//! parsing lives in [`parse_prefixed`] and the macro only stamps out the
//! newtype and its trait impls.

use crate::{IdError, Ulid};

/// Split `raw` into prefix and ULID, checking the prefix against `expected`.
pub fn parse_prefixed(raw: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }

    let (prefix, rest) = raw.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(IdError::WrongKind {
            expected,
            found: prefix.to_string(),
        });
    }

    rest.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}

/// Declare one or more entity ID newtypes.
///
/// ```ignore
/// define_ids! {
///     /// A daemon host.
///     HostId => "host",
///     /// A container on a host.
///     ContainerId => "ctr",
/// }
/// ```
#[macro_export]
macro_rules! define_ids {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name($crate::Ulid);

            impl $name {
                pub const PREFIX: &'static str = $prefix;

                /// A fresh ID, ordered after every ID minted before it.
                #[must_use]
                pub fn new() -> Self {
                    Self($crate::Ulid::new())
                }

                #[must_use]
                pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                    Self(ulid)
                }

                #[must_use]
                pub const fn ulid(&self) -> $crate::Ulid {
                    self.0
                }

                pub fn parse(raw: &str) -> Result<Self, $crate::IdError> {
                    $crate::macros::parse_prefixed(raw, Self::PREFIX).map(Self)
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}_{}", Self::PREFIX, self.0)
                }
            }

            impl std::str::FromStr for $name {
                type Err = $crate::IdError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Self::parse(s)
                }
            }

            impl serde::Serialize for $name {
                fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }

            impl<'de> serde::Deserialize<'de> for $name {
                fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let raw = String::deserialize(deserializer)?;
                    Self::parse(&raw).map_err(serde::de::Error::custom)
                }
            }
        )+
    };
}
