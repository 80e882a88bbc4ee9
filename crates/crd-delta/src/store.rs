//! Storage seams
//!
//! [`ResourceStore`] is the read-only view of current rows, [`DeltaLog`] the
//! append-only journal. [`TransactionalStore`] couples a row mutation with its
//! journal append so both commit or neither does.

use crate::error::DeltaError;
use crd_model::{Attrs, DeltaRecord, Operation, ResourceKind, Row, VersionId};

/// Current-state rows, owned by the CRUD layer
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// All rows of a kind, across tenants, ordered by id
    async fn rows(&self, kind: ResourceKind) -> Result<Vec<Row>, DeltaError>;

    /// Single row lookup
    async fn row(&self, kind: ResourceKind, id: &str) -> Result<Option<Row>, DeltaError>;
}

/// Append-only journal of change records
#[async_trait::async_trait]
pub trait DeltaLog: Send + Sync {
    /// Append a record, consuming exactly one new version
    async fn append(
        &self,
        kind: ResourceKind,
        id: &str,
        operation: Operation,
        payload: Attrs,
    ) -> Result<VersionId, DeltaError>;

    /// Records of `kind` matching `filter`, ascending by version
    async fn query(
        &self,
        kind: ResourceKind,
        filter: &RecordFilter,
    ) -> Result<Vec<DeltaRecord>, DeltaError>;

    /// All records newer than `version`, ascending
    async fn records_since(&self, version: VersionId) -> Result<Vec<DeltaRecord>, DeltaError>;

    /// Highest version appended so far
    async fn latest_version(&self) -> Result<Option<VersionId>, DeltaError>;
}

/// Row mutation paired with its journal record
#[async_trait::async_trait]
pub trait TransactionalStore: ResourceStore + DeltaLog {
    /// Apply `mutation` and append its record atomically
    async fn commit(&self, mutation: Mutation) -> Result<DeltaRecord, DeltaError>;
}

/// Journal query filter
///
/// `None` on a dimension means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub ids: Option<Vec<String>>,
    pub operations: Option<Vec<Operation>>,
}

impl RecordFilter {
    /// Match everything
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to resource ids
    #[inline]
    #[must_use]
    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to operations
    #[inline]
    #[must_use]
    pub fn with_operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }

    /// Filter selecting the create records of one resource
    #[inline]
    #[must_use]
    pub fn creates_of(id: &str) -> Self {
        Self::new().with_ids([id]).with_operations([Operation::Create])
    }

    /// Whether `record` passes the filter
    #[must_use]
    pub fn matches(&self, record: &DeltaRecord) -> bool {
        let id_ok = self
            .ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| *id == record.id));
        let op_ok = self
            .operations
            .as_ref()
            .map_or(true, |ops| ops.contains(&record.operation));
        id_ok && op_ok
    }
}

/// A mutation requested by the CRUD layer
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: ResourceKind,
    pub id: String,
    pub operation: Operation,
    /// New column values; merged into the row on update, ignored on delete
    pub attrs: Attrs,
}

impl Mutation {
    /// Create a resource
    #[must_use]
    pub fn create(kind: ResourceKind, row: Row) -> Self {
        Self {
            kind,
            id: row.id,
            operation: Operation::Create,
            attrs: row.attrs,
        }
    }

    /// Update columns of a resource
    #[must_use]
    pub fn update(kind: ResourceKind, id: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            kind,
            id: id.into(),
            operation: Operation::Update,
            attrs,
        }
    }

    /// Delete a resource
    #[must_use]
    pub fn delete(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            operation: Operation::Delete,
            attrs: Attrs::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, operation: Operation) -> DeltaRecord {
        DeltaRecord {
            id: id.to_string(),
            resource_kind: ResourceKind::Chain,
            operation,
            version_id: VersionId(1),
            payload: Attrs::new(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        let filter = RecordFilter::new();
        assert!(filter.matches(&record("a", Operation::Delete)));
    }

    #[test]
    fn creates_of_filters_both_dimensions() {
        let filter = RecordFilter::creates_of("a");
        assert!(filter.matches(&record("a", Operation::Create)));
        assert!(!filter.matches(&record("a", Operation::Update)));
        assert!(!filter.matches(&record("b", Operation::Create)));
    }

    #[test]
    fn mutation_create_takes_row_parts() {
        let m = Mutation::create(ResourceKind::Chain, Row::new("c1").with_attr("name", "x"));
        assert_eq!(m.id, "c1");
        assert_eq!(m.operation, Operation::Create);
        assert_eq!(m.attrs.len(), 1);
    }
}
