//! Error types for the Tabula extraction engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A shared error type for the entire extraction engine.
///
/// Every failure that exhausts local recovery reaches the caller as one of
/// these variants, carrying the field, offset or attempt count needed to decide
/// whether the whole operation is worth retrying.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum TabulaError {
    /// The long-lived session credential is missing, invalid or expired.
    #[error("Authentication expired for environment '{environment}': {message}")]
    AuthExpired {
        environment: String,
        message: String,
    },

    /// The aggregation backend rejected a dimension or metric field.
    #[error("Field not supported by server-side aggregation: {}", .field.as_deref().unwrap_or("<unknown>"))]
    FieldUnsupported {
        field: Option<String>,
        message: String,
    },

    /// An aggregation task never reached a terminal state within its budget.
    #[error("Aggregation task {task_id} timed out after {attempts} polls")]
    PollTimeout { task_id: String, attempts: u32 },

    /// A page could not be fetched after exhausting its retry budget.
    #[error("Page fetch failed at offset {offset} after {attempts} attempts: {message}")]
    PageFetch {
        offset: u64,
        attempts: u32,
        status: Option<u16>,
        message: String,
    },

    /// The backend reports fewer rows than a cached snapshot recorded.
    #[error("Backend total for '{key}' shrank from {recorded} to {observed}")]
    CacheShrinkage {
        key: String,
        recorded: u64,
        observed: u64,
    },

    /// A previously cached row changed at a stable offset.
    #[error("Cached row for '{key}' changed at offset {offset}")]
    CacheDrift { key: String, offset: u64 },

    /// Non-retryable API error (4xx other than authentication)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure (connection, timeout, malformed body)
    #[error("Network error: {0}")]
    Network(String),

    /// Entity not found error with type information
    #[error("Entity not found: {entity_type} '{id}'")]
    NotFound { entity_type: String, id: String },

    /// IO error (file system operations)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TabulaError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates an AuthExpired error
    pub fn auth_expired(environment: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthExpired {
            environment: environment.into(),
            message: message.into(),
        }
    }

    /// Creates a FieldUnsupported error
    pub fn field_unsupported(field: Option<String>, message: impl Into<String>) -> Self {
        Self::FieldUnsupported {
            field,
            message: message.into(),
        }
    }

    /// Creates a NotFound error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Creates an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this is an AuthExpired error
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }

    /// Check if this is a field-compatibility failure
    pub fn is_field_unsupported(&self) -> bool {
        matches!(self, Self::FieldUnsupported { .. })
    }

    /// Check if this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is an infrastructure failure that may succeed on retry.
    ///
    /// Compatibility failures and authentication failures are never retryable:
    /// retrying them produces the same answer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PollTimeout { .. } | Self::PageFetch { .. } | Self::Network(_)
        )
    }

    /// Returns the field name attached to a compatibility failure, if any.
    pub fn unsupported_field(&self) -> Option<&str> {
        match self {
            Self::FieldUnsupported { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for TabulaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for TabulaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for TabulaError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::ser::Error> for TabulaError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

/// Conversion from anyhow::Error (used at the binary/report-builder boundary)
impl From<anyhow::Error> for TabulaError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Conversion from String (for error messages)
impl From<String> for TabulaError {
    fn from(err: String) -> Self {
        Self::Internal(err)
    }
}

/// A type alias for `Result<T, TabulaError>`.
pub type Result<T> = std::result::Result<T, TabulaError>;
