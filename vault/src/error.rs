//! Error handling for the Botica vault
//!
//! Errors are split per concern (key material, cipher, sealed storage,
//! extraction, configuration, metrics) and wrapped by [`VaultError`]. None of
//! the messages produced here ever carry key bytes or plaintext cell values;
//! they name datasets, columns, paths and classifications only.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the vault
#[derive(Error, Debug)]
pub enum VaultError {
    /// Key provider errors
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Seal/unseal errors
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Sealed storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Structural extraction errors
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled before the dataset completed
    #[error("Processing cancelled")]
    Cancelled,

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Key provider errors. Never include the key value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Encryption key unavailable: {source_name} is not set")]
    Unavailable { source_name: String },

    #[error("Encryption key invalid: {reason}")]
    FormatInvalid { reason: String },
}

/// Seal/unseal errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Authentication tag verification failed")]
    AuthenticationFailed,

    #[error("Unsupported sealed format version: {version}")]
    UnsupportedFormatVersion { version: u8 },

    #[error("Malformed sealed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Sealed storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Dataset not found: {dataset_id}")]
    DatasetNotFound { dataset_id: String },

    #[error("Invalid dataset id: {dataset_id:?}")]
    InvalidDatasetId { dataset_id: String },

    #[error("Directory creation failed: {path}")]
    DirectoryCreationFailed { path: String },

    #[error("Sealed file write failed: {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Sealed file read failed: {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Source file unreadable: {path}")]
    SourceUnreadable { path: String },

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Structural extraction errors. Row-level problems are never errors; they
/// are quarantined by the extractor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Schema invalid: missing required columns {missing:?}")]
    SchemaInvalid { missing: Vec<String> },

    #[error("Input has no header row")]
    MissingHeader,

    #[error("Header row unreadable: {reason}")]
    HeaderUnreadable { reason: String },
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Metrics related errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric registration failed: {name}")]
    RegistrationFailed { name: String },

    #[error("Metrics export failed: {reason}")]
    ExportFailed { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, VaultError>;

/// A specialized result type for key operations
pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// A specialized result type for cipher operations
pub type CipherResult<T> = std::result::Result<T, CipherError>;

/// A specialized result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A specialized result type for extraction operations
pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for metrics operations
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// Classification carried by a failed dataset. Safe to show to the
/// presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    KeyUnavailable,
    KeyFormatInvalid,
    AuthenticationFailed,
    UnsupportedFormatVersion,
    MalformedRecord,
    SchemaInvalid,
    DatasetNotFound,
    Cancelled,
    Storage,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::KeyUnavailable => "key_unavailable",
            FailureReason::KeyFormatInvalid => "key_format_invalid",
            FailureReason::AuthenticationFailed => "authentication_failed",
            FailureReason::UnsupportedFormatVersion => "unsupported_format_version",
            FailureReason::MalformedRecord => "malformed_record",
            FailureReason::SchemaInvalid => "schema_invalid",
            FailureReason::DatasetNotFound => "dataset_not_found",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Storage => "storage",
            FailureReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&KeyError> for FailureReason {
    fn from(error: &KeyError) -> Self {
        match error {
            KeyError::Unavailable { .. } => FailureReason::KeyUnavailable,
            KeyError::FormatInvalid { .. } => FailureReason::KeyFormatInvalid,
        }
    }
}

impl From<&CipherError> for FailureReason {
    fn from(error: &CipherError) -> Self {
        match error {
            CipherError::AuthenticationFailed => FailureReason::AuthenticationFailed,
            CipherError::UnsupportedFormatVersion { .. } => FailureReason::UnsupportedFormatVersion,
            CipherError::MalformedRecord { .. } => FailureReason::MalformedRecord,
            CipherError::EncryptionFailed => FailureReason::Internal,
        }
    }
}

impl VaultError {
    /// Map this error onto the classification reported for a failed dataset
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            VaultError::Key(e) => e.into(),
            VaultError::Cipher(e) => e.into(),
            VaultError::Storage(StorageError::DatasetNotFound { .. }) => FailureReason::DatasetNotFound,
            VaultError::Storage(StorageError::Cipher(e)) => e.into(),
            VaultError::Storage(StorageError::Key(e)) => e.into(),
            VaultError::Storage(_) => FailureReason::Storage,
            VaultError::Extract(_) => FailureReason::SchemaInvalid,
            VaultError::Io(_) => FailureReason::Storage,
            VaultError::Cancelled => FailureReason::Cancelled,
            VaultError::Config(_)
            | VaultError::Metrics(_)
            | VaultError::Serialization(_)
            | VaultError::Generic(_) => FailureReason::Internal,
        }
    }

    /// Check whether this error belongs to the fatal/structural class that
    /// aborts a dataset without a partial result
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.failure_reason(),
            FailureReason::KeyUnavailable
                | FailureReason::KeyFormatInvalid
                | FailureReason::AuthenticationFailed
                | FailureReason::UnsupportedFormatVersion
                | FailureReason::MalformedRecord
                | FailureReason::SchemaInvalid
                | FailureReason::DatasetNotFound
        )
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            VaultError::Key(_) => "key",
            VaultError::Cipher(_) => "cipher",
            VaultError::Storage(_) => "storage",
            VaultError::Extract(_) => "extract",
            VaultError::Config(_) => "config",
            VaultError::Metrics(_) => "metrics",
            VaultError::Io(_) => "io",
            VaultError::Serialization(_) => "serialization",
            VaultError::Cancelled => "cancelled",
            VaultError::Generic(_) => "generic",
        }
    }
}

impl From<String> for VaultError {
    fn from(msg: String) -> Self {
        VaultError::Generic(msg)
    }
}

impl From<&str> for VaultError {
    fn from(msg: &str) -> Self {
        VaultError::Generic(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_mapping() {
        let error = VaultError::from(StorageError::DatasetNotFound { dataset_id: "enero".to_string() });
        assert_eq!(error.failure_reason(), FailureReason::DatasetNotFound);
        assert!(error.is_fatal());

        let error = VaultError::from(StorageError::Cipher(CipherError::AuthenticationFailed));
        assert_eq!(error.failure_reason(), FailureReason::AuthenticationFailed);
        assert_eq!(error.category(), "storage");

        let error = VaultError::from(ExtractError::SchemaInvalid { missing: vec!["unit_price".to_string()] });
        assert_eq!(error.failure_reason(), FailureReason::SchemaInvalid);
        assert!(error.is_fatal());

        let error = VaultError::Cancelled;
        assert_eq!(error.failure_reason(), FailureReason::Cancelled);
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_key_error_messages_name_source_only() {
        let error = KeyError::Unavailable { source_name: "BOTICA_ENCRYPTION_KEY".to_string() };
        assert_eq!(
            error.to_string(),
            "Encryption key unavailable: BOTICA_ENCRYPTION_KEY is not set"
        );
        assert_eq!(FailureReason::from(&error), FailureReason::KeyUnavailable);
    }

    #[test]
    fn test_error_conversion() {
        let error = VaultError::from("Test error");
        assert!(matches!(error, VaultError::Generic(_)));
        assert_eq!(error.failure_reason(), FailureReason::Internal);
    }

    #[test]
    fn test_failure_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::AuthenticationFailed).unwrap();
        assert_eq!(json, "\"authentication_failed\"");
        assert_eq!(FailureReason::SchemaInvalid.to_string(), "schema_invalid");
    }
}
