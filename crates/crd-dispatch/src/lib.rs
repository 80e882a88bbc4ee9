//! CRD Dispatch
//!
//! Delivery side of configuration sync:
//! - [`MessageBus`]: topic publish/subscribe seam, with the in-process [`LocalBus`]
//! - [`Dispatcher`]: fire-and-forget sends to relay agents and consumers
//! - [`SyncService`]: commits mutations, pushes live changes, answers resyncs
//!
//! # Example
//!
//! ```rust,ignore
//! use crd_dispatch::{LocalBus, SyncService};
//!
//! let bus = Arc::new(LocalBus::new());
//! let service = SyncService::new(store, bus.clone());
//!
//! // Stream the full ordered snapshot to one host
//! let report = service.resync("compute-1", None).await?;
//! println!("sent {} messages", report.messages);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod service;

pub use bus::{LocalBus, MessageBus, Subscription};
pub use dispatcher::{DispatchContext, Dispatcher};
pub use error::DispatchError;
pub use service::{MutationOutcome, ResyncReport, SyncService};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
