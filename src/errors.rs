//! Error types for the memosync library.
//!
//! This module defines the error taxonomy shared by the storage layers, the
//! entity services and the sync coordinator.

use std::{fmt, io};

use serde::Serialize;
use thiserror::Error;

/// Reason code attached to every [`MemoError::Storage`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageErrorCode {
    /// The underlying store rejected a write because it is full.
    QuotaExceeded,
    /// Stored text could not be parsed back into a value.
    CorruptedData,
    /// A value could not be serialized for storage.
    InvalidFormat,
    /// The operation targeted an id that does not exist.
    NotFound,
    /// The store refused access.
    PermissionDenied,
}

impl StorageErrorCode {
    /// Hint shown next to the error message in the UI, if any.
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            Self::QuotaExceeded => Some("Free up space by deleting old memos or attachments."),
            Self::CorruptedData => Some("Reload the application to recover stored data."),
            Self::PermissionDenied => Some("Check that local storage is enabled."),
            Self::InvalidFormat | Self::NotFound => None,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::QuotaExceeded => "quota-exceeded",
            Self::CorruptedData => "corrupted-data",
            Self::InvalidFormat => "invalid-format",
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
        };
        f.write_str(code)
    }
}

/// The main error type for the memosync library.
#[derive(Error, Debug)]
pub enum MemoError {
    /// Input failed a business rule. The message is user-facing.
    #[error("{message}")]
    Validation { message: String },

    /// Local storage failure with a reason code and optional context.
    #[error("Storage error ({code}): {message}")]
    Storage {
        code: StorageErrorCode,
        message: String,
        id: Option<String>,
        operation: Option<&'static str>,
    },

    /// The indexed store could not complete an operation.
    #[error("Indexed store error: {message}")]
    IndexedStore { message: String },

    /// A remote write was attempted while the network is down.
    #[error("Remote store is offline")]
    Offline,

    /// The remote document store failed or could not be reached.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Remote credentials are missing or are placeholder values.
    #[error("Remote store not configured: {message}")]
    RemoteNotConfigured { message: String },

    /// A file could not be converted into its stored representation.
    #[error("Failed to process file {file_name}: {message}")]
    FileProcessing { file_name: String, message: String },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Errors related to file I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to zip operations.
    #[error("Zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Errors related to backup operations.
    #[error("Backup failed: {message}")]
    BackupFailed { message: String },

    /// Error when attempting to restore from backup.
    #[error("Restore failed: {message}")]
    RestoreFailed { message: String },

    /// for mutex lock acquisition issues
    #[error("{message}")]
    LockAcquisitionFailed { message: String },
}

impl MemoError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            id: None,
            operation: None,
        }
    }

    /// Not-found failure for an operation on a missing id.
    pub fn not_found(operation: &'static str, id: &str) -> Self {
        Self::Storage {
            code: StorageErrorCode::NotFound,
            message: format!("{} not found", id),
            id: Some(id.to_string()),
            operation: Some(operation),
        }
    }

    pub fn indexed_store(message: impl Into<String>) -> Self {
        Self::IndexedStore {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Re-wraps a lower-layer failure into a `Storage` error carrying the
    /// operation name and the failing id.
    ///
    /// Validation, offline, network and file-processing errors are returned
    /// unchanged so their user-facing message survives.
    pub fn in_operation(self, operation: &'static str, id: Option<&str>) -> Self {
        let id = id.map(str::to_string);
        match self {
            Self::Storage {
                code,
                message,
                id: original_id,
                ..
            } => Self::Storage {
                code,
                message,
                id: original_id.or(id),
                operation: Some(operation),
            },
            Self::Serialization(e) => Self::Storage {
                code: StorageErrorCode::InvalidFormat,
                message: e.to_string(),
                id,
                operation: Some(operation),
            },
            Self::Io(e) => {
                let code = if e.kind() == io::ErrorKind::PermissionDenied {
                    StorageErrorCode::PermissionDenied
                } else {
                    StorageErrorCode::CorruptedData
                };
                Self::Storage {
                    code,
                    message: e.to_string(),
                    id,
                    operation: Some(operation),
                }
            }
            Self::LockAcquisitionFailed { message } => Self::Storage {
                code: StorageErrorCode::PermissionDenied,
                message,
                id,
                operation: Some(operation),
            },
            other => other,
        }
    }

    /// Storage reason code, if this is a storage failure.
    pub fn storage_code(&self) -> Option<StorageErrorCode> {
        match self {
            Self::Storage { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.storage_code() == Some(StorageErrorCode::NotFound)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Whether the UI can keep running after showing this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::ConfigError { .. } | Self::LockAcquisitionFailed { .. }
        )
    }
}
