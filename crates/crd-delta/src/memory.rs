//! In-process resource store and delta journal
//!
//! Rows and journal share one lock, so a mutation and its record commit
//! together. The version counter lives here and is only advanced by appends.

use crate::error::DeltaError;
use crate::store::{DeltaLog, Mutation, RecordFilter, ResourceStore, TransactionalStore};
use crd_model::{Attrs, DeltaRecord, Operation, ResourceKind, Row, VersionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Monotonic version source
///
/// Every append attempt consumes one value, including attempts that fail
/// afterwards, so the journal may contain gaps.
#[derive(Debug)]
struct VersionCounter {
    next: AtomicU64,
}

impl VersionCounter {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> VersionId {
        VersionId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<ResourceKind, BTreeMap<String, Row>>,
    log: Vec<DeltaRecord>,
}

/// Rows + journal behind a single lock
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    counter: VersionCounter,
    available: AtomicBool,
    failing_appends: AtomicUsize,
}

impl MemoryStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            counter: VersionCounter::new(),
            available: AtomicBool::new(true),
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Take the store offline (or back online)
    ///
    /// While offline every read and write fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail after consuming their version
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Insert a row without journaling it
    ///
    /// Models rows that predate delta tracking; such rows have no create
    /// record and surface as `MissingVersionRecord` in snapshots.
    pub fn import_untracked(&self, kind: ResourceKind, row: Row) {
        self.inner
            .lock()
            .rows
            .entry(kind)
            .or_default()
            .insert(row.id.clone(), row);
    }

    /// Every journaled record, ascending
    #[must_use]
    pub fn records(&self) -> Vec<DeltaRecord> {
        self.inner.lock().log.clone()
    }

    /// Number of current rows across kinds
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.inner.lock().rows.values().map(BTreeMap::len).sum()
    }

    fn check_available(&self) -> Result<(), DeltaError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeltaError::unavailable("memory store offline"))
        }
    }

    fn take_append_fault(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn append_locked(
        &self,
        inner: &mut Inner,
        kind: ResourceKind,
        id: &str,
        operation: Operation,
        payload: Attrs,
    ) -> Result<DeltaRecord, DeltaError> {
        let version_id = self.counter.allocate();
        if self.take_append_fault() {
            tracing::warn!(%kind, id, %version_id, "journal append failed");
            return Err(DeltaError::unavailable(format!(
                "append of {kind} {id} at version {version_id} failed"
            )));
        }

        let record = DeltaRecord {
            id: id.to_string(),
            resource_kind: kind,
            operation,
            version_id,
            payload,
        };
        inner.log.push(record.clone());
        tracing::trace!(%kind, id, %operation, %version_id, "journal append");
        Ok(record)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn rows(&self, kind: ResourceKind) -> Result<Vec<Row>, DeltaError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .rows
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn row(&self, kind: ResourceKind, id: &str) -> Result<Option<Row>, DeltaError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .rows
            .get(&kind)
            .and_then(|table| table.get(id))
            .cloned())
    }
}

#[async_trait::async_trait]
impl DeltaLog for MemoryStore {
    async fn append(
        &self,
        kind: ResourceKind,
        id: &str,
        operation: Operation,
        payload: Attrs,
    ) -> Result<VersionId, DeltaError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        self.append_locked(&mut inner, kind, id, operation, payload)
            .map(|record| record.version_id)
    }

    async fn query(
        &self,
        kind: ResourceKind,
        filter: &RecordFilter,
    ) -> Result<Vec<DeltaRecord>, DeltaError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .log
            .iter()
            .filter(|r| r.resource_kind == kind && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn records_since(&self, version: VersionId) -> Result<Vec<DeltaRecord>, DeltaError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .log
            .iter()
            .filter(|r| r.version_id > version)
            .cloned()
            .collect())
    }

    async fn latest_version(&self) -> Result<Option<VersionId>, DeltaError> {
        self.check_available()?;
        Ok(self.inner.lock().log.last().map(|r| r.version_id))
    }
}

#[async_trait::async_trait]
impl TransactionalStore for MemoryStore {
    async fn commit(&self, mutation: Mutation) -> Result<DeltaRecord, DeltaError> {
        self.check_available()?;
        let Mutation {
            kind,
            id,
            operation,
            attrs,
        } = mutation;

        let mut inner = self.inner.lock();
        let current = inner.rows.get(&kind).and_then(|t| t.get(&id)).cloned();

        // Compute the new row first; nothing is installed unless the append succeeds.
        let next = match (operation, current) {
            (Operation::Create, None) => Some(Row::with_attrs(id.clone(), attrs)),
            (Operation::Update, Some(mut row)) => {
                row.attrs.extend(attrs);
                Some(row)
            }
            (Operation::Delete, Some(_)) => None,
            (Operation::Create, Some(_)) => {
                return Err(DeltaError::InvalidMutation(format!(
                    "{kind} {id} already exists"
                )))
            }
            (_, None) => {
                return Err(DeltaError::InvalidMutation(format!(
                    "{operation} of missing {kind} {id}"
                )))
            }
        };

        let payload = match &next {
            Some(row) => row.snapshot(),
            None => inner
                .rows
                .get(&kind)
                .and_then(|t| t.get(&id))
                .map(Row::snapshot)
                .unwrap_or_default(),
        };

        let record = self.append_locked(&mut inner, kind, &id, operation, payload)?;

        let table = inner.rows.entry(kind).or_default();
        match next {
            Some(row) => {
                table.insert(id, row);
            }
            None => {
                table.remove(&id);
            }
        }
        Ok(record)
    }
}
