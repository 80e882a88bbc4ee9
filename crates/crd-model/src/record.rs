//! Current-state rows and journaled delta records

use crate::types::{Operation, ResourceKind, VersionId};
use crate::{fields, Attrs};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current-state row of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Resource identifier
    pub id: String,
    /// Column values
    pub attrs: Attrs,
}

impl Row {
    /// Create empty row
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attrs::new(),
        }
    }

    /// Create row from existing attributes
    #[inline]
    #[must_use]
    pub fn with_attrs(id: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            id: id.into(),
            attrs,
        }
    }

    /// Set a column
    #[inline]
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// String column value
    #[inline]
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// Full attribute snapshot including the identifier
    #[must_use]
    pub fn snapshot(&self) -> Attrs {
        let mut out = self.attrs.clone();
        out.insert(fields::ID.to_string(), Value::String(self.id.clone()));
        out
    }
}

/// One journaled mutation
///
/// Immutable once appended. `payload` is the full attribute snapshot at the
/// time of the change, not a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub id: String,
    pub resource_kind: ResourceKind,
    pub operation: Operation,
    pub version_id: VersionId,
    pub payload: Attrs,
}

impl DeltaRecord {
    /// Row view of the captured payload
    #[must_use]
    pub fn as_row(&self) -> Row {
        let mut attrs = self.payload.clone();
        attrs.remove(fields::ID);
        Row::with_attrs(self.id.clone(), attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_includes_id() {
        let row = Row::new("c1").with_attr("name", "edge");
        let snap = row.snapshot();
        assert_eq!(snap.get("id"), Some(&json!("c1")));
        assert_eq!(snap.get("name"), Some(&json!("edge")));
        assert!(!row.attrs.contains_key("id"));
    }

    #[test]
    fn record_as_row_strips_id() {
        let row = Row::new("s1").with_attr("chain_id", "c1");
        let record = DeltaRecord {
            id: "s1".to_string(),
            resource_kind: ResourceKind::ChainService,
            operation: Operation::Create,
            version_id: VersionId(3),
            payload: row.snapshot(),
        };
        assert_eq!(record.as_row(), row);
    }
}
