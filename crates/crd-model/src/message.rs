//! Wire messages
//!
//! Every message on the bus is a [`SyncMessage`] envelope
//! `{ "method": ..., "payload": {...} }`. Config pushes and resync requests
//! are typed views over that envelope.

use crate::error::ModelError;
use crate::record::Row;
use crate::types::{Operation, ResourceKind, VersionId};
use crate::{fields, Attrs};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unit delivered to a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Remote operation to perform, e.g. `create_chain`
    pub method: String,
    /// Resource attributes plus contextual fields
    pub payload: Attrs,
}

impl SyncMessage {
    /// Create message
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, payload: Attrs) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// Method name for an operation on a resource kind (`<operation>_<kind>`)
    #[inline]
    #[must_use]
    pub fn method_name(operation: Operation, kind: ResourceKind) -> String {
        format!("{}_{}", operation.as_str(), kind.as_str())
    }

    /// Build the message describing `row` at `version`
    ///
    /// Payload is the row snapshot plus `operation` and `version_id`.
    #[must_use]
    pub fn for_row(operation: Operation, kind: ResourceKind, row: &Row, version: VersionId) -> Self {
        let mut payload = row.snapshot();
        payload.insert(
            fields::OPERATION.to_string(),
            Value::String(operation.as_str().to_string()),
        );
        payload.insert(fields::VERSION_ID.to_string(), Value::from(version.get()));
        Self::new(Self::method_name(operation, kind), payload)
    }

    /// Add a contextual field
    #[inline]
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Version carried in the payload
    #[must_use]
    pub fn version_id(&self) -> Option<VersionId> {
        self.payload
            .get(fields::VERSION_ID)
            .and_then(Value::as_u64)
            .map(VersionId)
    }

    /// Operation and kind encoded in the method name, if it is a resource message
    #[must_use]
    pub fn target(&self) -> Option<(Operation, ResourceKind)> {
        let (op, kind) = self.method.split_once('_')?;
        Some((op.parse().ok()?, kind.parse().ok()?))
    }

    /// String payload field
    #[inline]
    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Encode as JSON bytes
    ///
    /// # Errors
    /// Returns `ModelError::Codec` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    ///
    /// # Errors
    /// Returns `ModelError::Codec` for malformed input
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Configuration to apply to one target instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPush {
    pub instance_id: String,
    pub config_request: String,
}

impl ConfigPush {
    /// Method name of explicit config pushes
    pub const METHOD: &'static str = "push_config";

    /// Create config push
    #[inline]
    #[must_use]
    pub fn new(instance_id: impl Into<String>, config_request: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            config_request: config_request.into(),
        }
    }

    /// Wrap as a bus message
    #[must_use]
    pub fn into_message(self) -> SyncMessage {
        let mut payload = Attrs::new();
        payload.insert(
            fields::INSTANCE_ID.to_string(),
            Value::String(self.instance_id),
        );
        payload.insert(
            fields::CONFIG_REQUEST.to_string(),
            Value::String(self.config_request),
        );
        SyncMessage::new(Self::METHOD, payload)
    }

    /// Resolve target and body from any message
    ///
    /// Target is `instance_id`, falling back to the resource `id`. Body is
    /// `config_request` when present, otherwise the whole payload as JSON.
    ///
    /// # Errors
    /// Returns `ModelError::InvalidMessage` when no target can be resolved
    pub fn from_message(message: &SyncMessage) -> Result<Self, ModelError> {
        let instance_id = message
            .field_str(fields::INSTANCE_ID)
            .or_else(|| message.field_str(fields::ID))
            .ok_or_else(|| {
                ModelError::invalid(format!("{}: no target instance id", message.method))
            })?;

        let config_request = match message.payload.get(fields::CONFIG_REQUEST) {
            Some(Value::String(body)) => body.clone(),
            Some(other) => other.to_string(),
            None => serde_json::to_string(&message.payload)?,
        };

        Ok(Self::new(instance_id, config_request))
    }
}

/// Request for a state resync, sent by an agent after (re)subscribing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// Host whose relay topic should receive the stream
    pub host: String,
    /// Last version the agent applied; `None` asks for a full snapshot
    pub since: Option<VersionId>,
}

impl ResyncRequest {
    /// Method name of resync requests
    pub const METHOD: &'static str = "resync";

    /// Wrap as a bus message
    ///
    /// # Errors
    /// Returns `ModelError::Codec` if serialization fails
    pub fn into_message(self) -> Result<SyncMessage, ModelError> {
        match serde_json::to_value(self)? {
            Value::Object(payload) => Ok(SyncMessage::new(Self::METHOD, payload)),
            _ => Err(ModelError::invalid("resync request is not an object")),
        }
    }

    /// Parse from a bus message
    ///
    /// # Errors
    /// Returns `ModelError::InvalidMessage` for other methods, `Codec` for bad payloads
    pub fn from_message(message: &SyncMessage) -> Result<Self, ModelError> {
        if message.method != Self::METHOD {
            return Err(ModelError::invalid(format!(
                "expected {}, got {}",
                Self::METHOD,
                message.method
            )));
        }
        Ok(serde_json::from_value(Value::Object(message.payload.clone()))?)
    }
}

/// Trailer closing a resync stream
///
/// Carries the journal version the stream brought the host up to. Agents
/// record it as their watermark; it is never applied to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncComplete {
    pub version_id: VersionId,
}

impl SyncComplete {
    /// Method name of resync trailers
    pub const METHOD: &'static str = "sync_complete";

    /// Wrap as a bus message
    #[must_use]
    pub fn into_message(self) -> SyncMessage {
        let mut payload = Attrs::new();
        payload.insert(
            fields::VERSION_ID.to_string(),
            Value::from(self.version_id.get()),
        );
        SyncMessage::new(Self::METHOD, payload)
    }

    /// Parse from a bus message, `None` for any other method
    ///
    /// # Errors
    /// Returns `ModelError::InvalidMessage` for a trailer without a version
    pub fn from_message(message: &SyncMessage) -> Result<Option<Self>, ModelError> {
        if message.method != Self::METHOD {
            return Ok(None);
        }
        let version_id = message
            .version_id()
            .ok_or_else(|| ModelError::invalid("sync_complete without version_id"))?;
        Ok(Some(Self { version_id }))
    }
}
