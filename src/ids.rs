//! Validated identifier newtypes used throughout the kernel.
//!
//! Mirrors the validation-at-construction style of [`crate::types::ModelName`] and
//! [`crate::types::BaseUrl`]: an id is either a well-formed `AgentId`/`CallId`/`SnapshotId`
//! or it never exists.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh id using a UUIDv4 body.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, uuid::Uuid::new_v4()))
            }

            /// Wraps an existing string id without validation beyond non-emptiness.
            ///
            /// Used when rehydrating ids already persisted by a `Store`.
            pub fn from_existing(raw: impl Into<String>) -> crate::Result<Self> {
                let raw = raw.into();
                if raw.trim().is_empty() {
                    return Err(crate::Error::invalid_input(concat!(
                        stringify!($name),
                        " cannot be empty"
                    )));
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(AgentId, "agent-");
id_newtype!(CallId, "call-");
id_newtype!(SnapshotId, "snap-");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("agent-"));
    }

    #[test]
    fn from_existing_rejects_blank() {
        assert!(CallId::from_existing("   ").is_err());
        assert!(CallId::from_existing("call-123").is_ok());
    }

    #[test]
    fn display_matches_as_str() {
        let id = SnapshotId::generate();
        assert_eq!(id.to_string(), id.as_str());
    }
}
