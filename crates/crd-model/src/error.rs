//! Error types for the shared model

/// Model parsing and codec errors
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Resource kind tag not in the closed set
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// Operation tag not one of create/update/delete
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Message is well-formed JSON but missing required content
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// JSON encode/decode failure
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ModelError {
    /// Create invalid message error
    #[inline]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_display() {
        let err = ModelError::UnknownKind("router".to_string());
        assert_eq!(err.to_string(), "unknown resource kind: router");

        let err = ModelError::invalid("no instance id");
        assert!(err.to_string().contains("no instance id"));
    }
}
