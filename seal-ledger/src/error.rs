//! Error types for the ledger

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input
    #[error("{0}")]
    Validation(String),

    /// Caller may not see the requested row
    #[error("{0}")]
    Forbidden(String),

    /// Block, item or row absent
    #[error("{0}")]
    NotFound(String),

    /// Lock held, commit in progress, unique race, row not yet sealed
    #[error("{message}")]
    Conflict {
        /// User-visible message
        message: String,
        /// Structured context for the caller
        details: Option<Value>,
    },

    /// Chain is broken at `height`
    #[error("Ledger integrity failure at height {height} ({field}): {message}")]
    Integrity {
        /// Height of the offending block (0 when not block-scoped)
        height: u64,
        /// Field that failed recomputation
        field: String,
        /// Description
        message: String,
    },

    /// Missing schema columns, bad settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unique index violation in the document store
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage error (RocksDB or memory backend)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Relational store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// User-visible error body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    /// HTTP-class status
    pub status: u16,
    /// Message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Error {
    /// Conflict without details
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            details: None,
        }
    }

    /// Conflict carrying structured details
    pub fn conflict_with(message: impl Into<String>, details: Value) -> Self {
        Error::Conflict {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Integrity failure for a block field
    pub fn integrity(height: u64, field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Integrity {
            height,
            field: field.into(),
            message: message.into(),
        }
    }

    /// HTTP-class status code
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict { .. } | Error::Integrity { .. } | Error::DuplicateKey(_) => 409,
            _ => 500,
        }
    }

    /// Lock contention or unique races; expected under concurrency
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::DuplicateKey(_))
    }

    /// Body suitable for an API response or the action log
    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            Error::Conflict { details, .. } => details.clone(),
            Error::Integrity { height, field, .. } => {
                Some(serde_json::json!({ "height": height, "field": field }))
            }
            _ => None,
        };
        let message = match self {
            Error::Database(_) | Error::Storage(_) | Error::Io(_) | Error::Serialization(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            status: self.status(),
            message,
            details,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Configuration(format!("metrics registry: {}", err))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("x".into()).status(), 400);
        assert_eq!(Error::Forbidden("x".into()).status(), 403);
        assert_eq!(Error::NotFound("x".into()).status(), 404);
        assert_eq!(Error::conflict("x").status(), 409);
        assert_eq!(Error::integrity(3, "merkleRoot", "x").status(), 409);
        assert_eq!(Error::Storage("x".into()).status(), 500);
    }

    #[test]
    fn test_body_hides_infrastructure_detail() {
        let body = Error::Storage("disk on fire".into()).to_body();
        assert_eq!(body.status, 500);
        assert_eq!(body.message, "Internal server error");

        let body = Error::conflict_with("busy", serde_json::json!({ "owner": "srv:1" })).to_body();
        assert_eq!(body.message, "busy");
        assert_eq!(body.details.unwrap()["owner"], "srv:1");
    }

    #[test]
    fn test_integrity_is_not_a_conflict() {
        assert!(Error::conflict("busy").is_conflict());
        assert!(Error::DuplicateKey("height".into()).is_conflict());
        assert!(!Error::integrity(1, "prevHash", "broken").is_conflict());
    }
}
