//! CRD Delta
//!
//! The "what changed and in what order" half of configuration sync:
//! - [`DeltaLog`]: append-only journal stamped with global versions
//! - [`ResourceStore`]: read view of current rows
//! - [`MemoryStore`]: rows and journal committed together
//! - [`KindEmitter`] / [`EmitterRegistry`]: one message strategy per resource kind
//! - [`DeltaComputer`]: ordered full snapshots and incremental tails
//!
//! # Example
//!
//! ```rust,ignore
//! use crd_delta::{DeltaComputer, MemoryStore, Mutation, TransactionalStore};
//! use crd_model::{ResourceKind, Row};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.commit(Mutation::create(ResourceKind::Chain, Row::new("C1"))).await?;
//!
//! let snapshot = DeltaComputer::from_store(store).snapshot().await?;
//! for message in &snapshot.messages {
//!     println!("{} @ {:?}", message.method, message.version_id());
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod computer;
pub mod emitter;
pub mod error;
pub mod memory;
pub mod store;

pub use computer::{DeltaComputer, RowError, Snapshot};
pub use emitter::{ApplianceInstanceEmitter, EmitterRegistry, KindEmitter, PlainEmitter};
pub use error::DeltaError;
pub use memory::MemoryStore;
pub use store::{DeltaLog, Mutation, RecordFilter, ResourceStore, TransactionalStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
