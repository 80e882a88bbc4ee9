//! Snapshot computation
//!
//! Rebuilds the ordered message stream that takes a consumer from nothing
//! (or from a watermark) to current global state:
//! - current rows are read per kind, parents before children
//! - each row's originating version is recovered from its latest create record
//! - messages are ordered by version, so a consumer applying them in
//!   sequence never meets a foreign key it has not created yet

use crate::emitter::EmitterRegistry;
use crate::error::DeltaError;
use crate::store::{DeltaLog, RecordFilter, ResourceStore};
use crd_model::{DeltaRecord, ResourceKind, Row, SyncMessage, VersionId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A per-row failure recorded while the rest of the snapshot proceeds
#[derive(Debug)]
pub struct RowError {
    pub kind: ResourceKind,
    pub id: String,
    pub error: DeltaError,
}

/// Ordered message stream plus the anomalies met while building it
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Messages ascending by version
    pub messages: Vec<SyncMessage>,
    /// Rows that could not be emitted
    pub errors: Vec<RowError>,
    /// Highest journal version at the time of the run
    pub high_water: Option<VersionId>,
}

impl Snapshot {
    /// Whether every row was emitted
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of messages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if snapshot has no messages
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Builds snapshots and incremental tails from rows + journal
#[derive(Clone)]
pub struct DeltaComputer {
    store: Arc<dyn ResourceStore>,
    log: Arc<dyn DeltaLog>,
    emitters: Arc<EmitterRegistry>,
}

impl DeltaComputer {
    /// Create computer over separate row and journal stores
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        log: Arc<dyn DeltaLog>,
        emitters: EmitterRegistry,
    ) -> Self {
        Self {
            store,
            log,
            emitters: Arc::new(emitters),
        }
    }

    /// Create computer over one store serving both roles, with default emitters
    #[must_use]
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ResourceStore + DeltaLog + 'static,
    {
        Self::new(store.clone(), store, EmitterRegistry::with_defaults())
    }

    /// Full snapshot of current state
    ///
    /// # Errors
    /// Returns `DeltaError::StorageUnavailable` if rows or journal cannot be read.
    /// Per-row anomalies are collected in [`Snapshot::errors`] instead.
    pub async fn snapshot(&self) -> Result<Snapshot, DeltaError> {
        let high_water = self.log.latest_version().await?;
        let mut by_version: BTreeMap<VersionId, SyncMessage> = BTreeMap::new();
        let mut errors = Vec::new();

        for kind in ResourceKind::ALL {
            let rows = self.store.rows(kind).await?;
            for row in rows {
                match self.create_message(kind, &row).await {
                    Ok((version, message)) => {
                        by_version.insert(version, message);
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!(%kind, id = %row.id, %error, "row skipped in snapshot");
                        errors.push(RowError {
                            kind,
                            id: row.id,
                            error,
                        });
                    }
                }
            }
        }

        tracing::debug!(
            messages = by_version.len(),
            skipped = errors.len(),
            high_water = ?high_water,
            "snapshot computed"
        );

        Ok(Snapshot {
            messages: by_version.into_values().collect(),
            errors,
            high_water,
        })
    }

    /// Messages for every journal record newer than `since`
    ///
    /// # Errors
    /// Returns `DeltaError::StorageUnavailable` if the journal cannot be read
    pub async fn tail(&self, since: VersionId) -> Result<Snapshot, DeltaError> {
        let records = self.log.records_since(since).await?;
        let high_water = records.last().map(|r| r.version_id).or(Some(since));
        let mut messages = Vec::with_capacity(records.len());
        let mut errors = Vec::new();

        for record in records {
            match self.record_message(&record).await {
                Ok(message) => messages.push(message),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        kind = %record.resource_kind,
                        id = %record.id,
                        version_id = %record.version_id,
                        %error,
                        "record skipped in tail"
                    );
                    errors.push(RowError {
                        kind: record.resource_kind,
                        id: record.id,
                        error,
                    });
                }
            }
        }

        Ok(Snapshot {
            messages,
            errors,
            high_water,
        })
    }

    /// Snapshot for a consumer at `watermark`
    ///
    /// A consumer without a watermark always gets the full snapshot.
    ///
    /// # Errors
    /// Propagates storage failures
    pub async fn catch_up(&self, watermark: Option<VersionId>) -> Result<Snapshot, DeltaError> {
        match watermark {
            Some(since) => self.tail(since).await,
            None => self.snapshot().await,
        }
    }

    /// Message for a single journal record, as pushed on live mutation
    ///
    /// # Errors
    /// Returns emitter errors (missing foreign keys) and storage failures
    pub async fn record_message(&self, record: &DeltaRecord) -> Result<SyncMessage, DeltaError> {
        let emitter = self.emitters.get(record.resource_kind)?;
        emitter
            .emit(
                record.operation,
                &record.as_row(),
                record.version_id,
                self.store.as_ref(),
            )
            .await
    }

    /// Originating version of `row`: the highest create record for its id
    async fn originating_version(
        &self,
        kind: ResourceKind,
        row: &Row,
    ) -> Result<VersionId, DeltaError> {
        let mut creates = self
            .log
            .query(kind, &RecordFilter::creates_of(&row.id))
            .await?;
        creates.sort_by(|a, b| b.version_id.cmp(&a.version_id));
        creates
            .first()
            .map(|record| record.version_id)
            .ok_or_else(|| DeltaError::MissingVersionRecord {
                kind,
                id: row.id.clone(),
            })
    }

    async fn create_message(
        &self,
        kind: ResourceKind,
        row: &Row,
    ) -> Result<(VersionId, SyncMessage), DeltaError> {
        let version = self.originating_version(kind, row).await?;
        let message = self
            .emitters
            .get(kind)?
            .emit_create(row, version, self.store.as_ref())
            .await?;
        Ok((version, message))
    }
}

impl std::fmt::Debug for DeltaComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaComputer")
            .field("emitters", &self.emitters.len())
            .finish_non_exhaustive()
    }
}
