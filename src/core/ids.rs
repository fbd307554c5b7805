//! Node and area identity atoms.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

/// Node identifier - non-empty string, unique in the network.
///
/// Nodes name themselves in configuration. The lexicographic order of node
/// ids is part of the merge tie-break, so ids must compare bytewise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    const MAX_LEN: usize = 128;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        if raw.is_empty() {
            return Err(InvalidId::Node {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.len() > Self::MAX_LEN {
            return Err(InvalidId::Node {
                raw,
                reason: format!("length must be <= {}", Self::MAX_LEN),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        NodeId::parse(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> String {
        id.0
    }
}

/// Area identifier - an independent replication domain within a node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AreaId(String);

impl AreaId {
    const MAX_LEN: usize = 64;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        if raw.is_empty() {
            return Err(InvalidId::Area {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.len() > Self::MAX_LEN {
            return Err(InvalidId::Area {
                raw,
                reason: format!("length must be <= {}", Self::MAX_LEN),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AreaId({:?})", self.0)
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AreaId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        AreaId::parse(s)
    }
}

impl From<AreaId> for String {
    fn from(id: AreaId) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_empty() {
        assert!(NodeId::parse("").is_err());
        assert!(NodeId::parse("node-1").is_ok());
    }

    #[test]
    fn area_id_orders_bytewise() {
        let a = AreaId::parse("area-a").unwrap();
        let b = AreaId::parse("area-b").unwrap();
        assert!(a < b);
    }
}
