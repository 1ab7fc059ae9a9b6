//! Node identifiers.
//!
//! Node ids are assigned by the state store on create and treated as
//! opaque strings by every service. The in-memory store mints ULIDs so
//! that ids remain lexicographically sortable by creation time; the HTTP
//! store passes through whatever the server assigned.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// An opaque, stable node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a new locally unique id.
    ///
    /// Only the in-memory state store uses this; ids from the HTTP store
    /// are server-assigned.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wraps a server-assigned id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "node id must not be empty".to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_id_rejected() {
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn id_round_trips_through_serde() {
        let id = NodeId::new("64f5c8d3a7b21e0012345678");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"64f5c8d3a7b21e0012345678\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
