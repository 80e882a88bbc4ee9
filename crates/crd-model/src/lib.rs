//! CRD Model
//!
//! Types shared by every side of configuration delta synchronization:
//! - [`ResourceKind`] and [`Operation`]: what changed and how
//! - [`VersionId`]: position in the global delta journal
//! - [`Row`] and [`DeltaRecord`]: current state and journaled change
//! - [`SyncMessage`], [`ConfigPush`], [`ResyncRequest`]: wire messages
//! - topic naming for relay agents, consumers and the server
//!
//! # Example
//!
//! ```rust
//! use crd_model::{Operation, ResourceKind, Row, SyncMessage, VersionId};
//!
//! let row = Row::new("c1").with_attr("name", "web-chain");
//! let msg = SyncMessage::for_row(Operation::Create, ResourceKind::Chain, &row, VersionId(10));
//!
//! assert_eq!(msg.method, "create_chain");
//! assert_eq!(msg.version_id(), Some(VersionId(10)));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod message;
pub mod record;
pub mod topic;
pub mod types;

pub use error::ModelError;
pub use message::{ConfigPush, ResyncRequest, SyncComplete, SyncMessage};
pub use record::{DeltaRecord, Row};
pub use topic::{relay_topic, CONSUMER_TOPIC, DEFAULT_TOPIC_PREFIX, SERVER_TOPIC};
pub use types::{Operation, ResourceKind, VersionId};

/// JSON object used for row attributes and message payloads
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// Payload field names with protocol meaning
pub mod fields {
    pub const ID: &str = "id";
    pub const OPERATION: &str = "operation";
    pub const VERSION_ID: &str = "version_id";
    pub const INSTANCE_ID: &str = "instance_id";
    pub const CONFIG_REQUEST: &str = "config_request";
    pub const CHAIN_ID: &str = "chain_id";
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
