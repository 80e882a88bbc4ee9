//! Core identifiers
//!
//! - Resource kinds in foreign-key dependency order
//! - Journal operations
//! - Global journal versions

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position in the global delta journal
///
/// Unique across all resource kinds. Ordering between two versions is the
/// ordering in which their records were appended; gaps carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Raw counter value
    #[inline]
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Journal operation tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// All operations
    pub const ALL: [Operation; 3] = [Self::Create, Self::Update, Self::Delete];

    /// Wire tag
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ModelError::UnknownOperation(s.to_string()))
    }
}

/// Category of managed object
///
/// Declaration order is the dependency order used for snapshot emission:
/// every kind appears after each kind it references by foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Service function chain
    Chain,
    /// Network function definition
    Service,
    /// Group of chains selected by rules
    ChainSet,
    /// Traffic that skips a chain
    BypassRule,
    /// Position of a service within a chain
    ChainService,
    /// Traffic classifier steering into a chain
    SelectionRule,
    /// Binding of a chain set to networks
    NetworkMap,
    /// Running appliance behind a chain-service mapping
    ApplianceInstance,
}

impl ResourceKind {
    /// All kinds in dependency order
    pub const ALL: [ResourceKind; 8] = [
        Self::Chain,
        Self::Service,
        Self::ChainSet,
        Self::BypassRule,
        Self::ChainService,
        Self::SelectionRule,
        Self::NetworkMap,
        Self::ApplianceInstance,
    ];

    /// Wire tag
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chain => "chain",
            Self::Service => "service",
            Self::ChainSet => "chain_set",
            Self::BypassRule => "bypass_rule",
            Self::ChainService => "chain_service",
            Self::SelectionRule => "selection_rule",
            Self::NetworkMap => "network_map",
            Self::ApplianceInstance => "appliance_instance",
        }
    }

    /// Foreign-key columns stored on rows of this kind, with the kind each references
    #[must_use]
    pub fn foreign_keys(self) -> &'static [(&'static str, ResourceKind)] {
        match self {
            Self::Chain | Self::Service | Self::ChainSet => &[],
            Self::BypassRule => &[("chain_id", Self::Chain)],
            Self::ChainService => &[("chain_id", Self::Chain), ("service_id", Self::Service)],
            Self::SelectionRule => &[("chain_set_id", Self::ChainSet), ("chain_id", Self::Chain)],
            Self::NetworkMap => &[("chain_set_id", Self::ChainSet)],
            Self::ApplianceInstance => &[("appliance_map_id", Self::ChainService)],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ModelError::UnknownKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_foreign_key_order() {
        for (pos, kind) in ResourceKind::ALL.iter().enumerate() {
            for (_, parent) in kind.foreign_keys() {
                let parent_pos = ResourceKind::ALL.iter().position(|k| *k == *parent).unwrap();
                assert!(parent_pos < pos, "{parent} must precede {kind}");
            }
        }
    }

    #[test]
    fn kind_tags_parse_back() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!(matches!(
            "router".parse::<ResourceKind>(),
            Err(ModelError::UnknownKind(_))
        ));
    }

    #[test]
    fn operation_serde_uses_wire_tag() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
    }

    #[test]
    fn version_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&VersionId(42)).unwrap(), "42");
    }
}
