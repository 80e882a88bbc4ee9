//! Per-kind message emission
//!
//! One [`KindEmitter`] per resource kind turns a row into its
//! [`SyncMessage`], adding whatever foreign keys the consumer needs to place
//! the resource in its local graph. Emitters are looked up through an
//! [`EmitterRegistry`] built once at startup.

use crate::error::DeltaError;
use crate::store::ResourceStore;
use crd_model::{fields, Operation, ResourceKind, Row, SyncMessage, VersionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Strategy for building the messages of one resource kind
#[async_trait::async_trait]
pub trait KindEmitter: Send + Sync + fmt::Debug {
    /// Kind this emitter handles
    fn kind(&self) -> ResourceKind;

    /// Build the message for `operation` on `row` at `version`
    ///
    /// `store` is consulted for denormalized foreign keys.
    async fn emit(
        &self,
        operation: Operation,
        row: &Row,
        version: VersionId,
        store: &dyn ResourceStore,
    ) -> Result<SyncMessage, DeltaError>;

    /// Build the snapshot `create_<kind>` message
    async fn emit_create(
        &self,
        row: &Row,
        version: VersionId,
        store: &dyn ResourceStore,
    ) -> Result<SyncMessage, DeltaError> {
        self.emit(Operation::Create, row, version, store).await
    }
}

/// Emitter for kinds whose rows already carry every key consumers need
#[derive(Debug, Clone, Copy)]
pub struct PlainEmitter {
    kind: ResourceKind,
}

impl PlainEmitter {
    /// Create plain emitter
    #[inline]
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

#[async_trait::async_trait]
impl KindEmitter for PlainEmitter {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn emit(
        &self,
        operation: Operation,
        row: &Row,
        version: VersionId,
        _store: &dyn ResourceStore,
    ) -> Result<SyncMessage, DeltaError> {
        Ok(SyncMessage::for_row(operation, self.kind, row, version))
    }
}

/// Appliance instances also carry the chain owning their mapping
///
/// The instance row only stores `appliance_map_id`; the relay agent needs
/// `chain_id` as well, resolved through the chain-service mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplianceInstanceEmitter;

impl ApplianceInstanceEmitter {
    const MAP_FIELD: &'static str = "appliance_map_id";

    async fn owning_chain(
        row: &Row,
        store: &dyn ResourceStore,
    ) -> Result<String, DeltaError> {
        let missing = |field| DeltaError::MissingForeignKey {
            kind: ResourceKind::ApplianceInstance,
            id: row.id.clone(),
            field,
        };

        let map_id = row.attr_str(Self::MAP_FIELD).ok_or_else(|| missing(Self::MAP_FIELD))?;
        let mapping = store
            .row(ResourceKind::ChainService, map_id)
            .await?
            .ok_or_else(|| missing(Self::MAP_FIELD))?;
        mapping
            .attr_str(fields::CHAIN_ID)
            .map(str::to_string)
            .ok_or_else(|| missing(fields::CHAIN_ID))
    }
}

#[async_trait::async_trait]
impl KindEmitter for ApplianceInstanceEmitter {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ApplianceInstance
    }

    async fn emit(
        &self,
        operation: Operation,
        row: &Row,
        version: VersionId,
        store: &dyn ResourceStore,
    ) -> Result<SyncMessage, DeltaError> {
        let message = SyncMessage::for_row(operation, ResourceKind::ApplianceInstance, row, version);
        // The mapping may already be gone when replaying a delete.
        if operation == Operation::Delete {
            return Ok(message);
        }
        let chain_id = Self::owning_chain(row, store).await?;
        Ok(message.with_field(fields::CHAIN_ID, chain_id))
    }
}

/// Lookup table from resource kind to its emitter
#[derive(Debug, Clone, Default)]
pub struct EmitterRegistry {
    emitters: HashMap<ResourceKind, Arc<dyn KindEmitter>>,
}

impl EmitterRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            emitters: HashMap::new(),
        }
    }

    /// Create registry with an emitter for every kind
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(PlainEmitter::new(kind)));
        }
        registry.register(Arc::new(ApplianceInstanceEmitter));
        registry
    }

    /// Register an emitter, replacing any previous one for its kind
    pub fn register(&mut self, emitter: Arc<dyn KindEmitter>) {
        self.emitters.insert(emitter.kind(), emitter);
    }

    /// Emitter for `kind`
    ///
    /// # Errors
    /// Returns `DeltaError::NoEmitter` if none is registered
    pub fn get(&self, kind: ResourceKind) -> Result<&dyn KindEmitter, DeltaError> {
        self.emitters
            .get(&kind)
            .map(|emitter| &**emitter)
            .ok_or(DeltaError::NoEmitter(kind))
    }

    /// Whether `kind` has an emitter
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.emitters.contains_key(&kind)
    }

    /// Number of registered emitters
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }
}
