//! Error types for wander-core

use thiserror::Error;

use crate::models::EntityKind;
use crate::remote::RemoteError;

/// Result type alias using wander-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in wander-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record references another record that is not available locally
    #[error("Missing {kind} dependency: {id}")]
    MissingDependency {
        /// Kind of the missing record.
        kind: EntityKind,
        /// Identifier of the missing record.
        id: String,
    },

    /// Stored or received data could not be interpreted
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Remote backend error
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Error {
    /// Returns true when the failure is transient and the next sync cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(error) => error.is_retryable(),
            Self::Database(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("database is locked") || message.contains("database busy")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_names_kind_and_id() {
        let error = Error::MissingDependency {
            kind: EntityKind::Place,
            id: "place-9".to_string(),
        };
        assert_eq!(error.to_string(), "Missing place dependency: place-9");
    }

    #[test]
    fn locked_database_is_retryable() {
        assert!(Error::Database("database is locked".to_string()).is_retryable());
        assert!(!Error::InvalidInput("empty".to_string()).is_retryable());
    }
}
