//! Error types for the delta journal and snapshot computation
//!
//! Splits failures into:
//! - systemic storage failures that abort a whole computation
//! - per-row data anomalies that are recorded and skipped
//! - rejected mutations

use crd_model::{ModelError, ResourceKind};

/// Delta subsystem error
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    /// Journal or resource store cannot be reached
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Row exists but its creation was never journaled
    #[error("no create record for {kind} {id}")]
    MissingVersionRecord { kind: ResourceKind, id: String },

    /// Foreign key needed for denormalization is absent or dangling
    #[error("{kind} {id}: cannot resolve {field}")]
    MissingForeignKey {
        kind: ResourceKind,
        id: String,
        field: &'static str,
    },

    /// No emitter registered for the kind
    #[error("no emitter registered for {0}")]
    NoEmitter(ResourceKind),

    /// Mutation inconsistent with current state
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Model error
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl DeltaError {
    /// Whether the error aborts the whole computation
    ///
    /// Only storage failures are systemic; everything else concerns one row.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Create storage unavailable error
    #[inline]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StorageUnavailable(reason.into())
    }
}
