//! Error types for the synchronization core.
//!
//! Errors are serializable so webhook and command callers receive a
//! structured body instead of a bare message.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by queue, ledger, ingestion and dispatch operations.
///
/// All variants serialize to `{"type": ..., "details": {...}}`.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// No root mapping or connector matches the requested coordinates.
    #[error("Configuration not found: {message}")]
    ConfigurationNotFound {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },

    /// Webhook payload could not be interpreted.
    #[error("Malformed payload: {message}")]
    PayloadMalformed { message: String },

    /// Shared store or remote collaborator unavailable. Safe to retry.
    #[error("Storage error: {message}")]
    TransientInfra {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Request has used all of its retries.
    #[error("Retry budget exceeded for request {request_id} after {retry_count} retries")]
    RetryBudgetExceeded { request_id: String, retry_count: i64 },

    /// A direction handler failed or panicked.
    #[error("Handler fault: {message}")]
    HandlerFault {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Invalid input provided.
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Create a configuration-not-found error.
    pub fn configuration_not_found(message: impl Into<String>) -> Self {
        Self::ConfigurationNotFound {
            message: message.into(),
            repo: None,
            branch: None,
        }
    }

    /// Create a configuration-not-found error for a repo/branch pair.
    pub fn configuration_not_found_for(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        let repo = repo.into();
        let branch = branch.into();
        Self::ConfigurationNotFound {
            message: format!("no root mapping for {}@{}", repo, branch),
            repo: Some(repo),
            branch: Some(branch),
        }
    }

    /// Create a malformed payload error.
    pub fn payload_malformed(message: impl Into<String>) -> Self {
        Self::PayloadMalformed {
            message: message.into(),
        }
    }

    /// Create a transient infrastructure error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientInfra {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a transient infrastructure error with operation context.
    pub fn transient_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::TransientInfra {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a retry-budget error.
    pub fn retry_budget_exceeded(request_id: impl Into<String>, retry_count: i64) -> Self {
        Self::RetryBudgetExceeded {
            request_id: request_id.into(),
            retry_count,
        }
    }

    /// Create a handler fault.
    pub fn handler_fault(message: impl Into<String>) -> Self {
        Self::HandlerFault {
            message: message.into(),
            request_id: None,
        }
    }

    /// Create a handler fault attributed to a request.
    pub fn handler_fault_for(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::HandlerFault {
            message: message.into(),
            request_id: Some(request_id.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid input error with field name.
    pub fn invalid_input_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra { .. })
    }

    /// Whether this error means the coordinates have no configuration.
    pub fn is_configuration_not_found(&self) -> bool {
        matches!(self, Self::ConfigurationNotFound { .. })
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row"),
            other => Self::transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for SyncError {
    fn from(err: crate::db::DbError) -> Self {
        Self::transient_with_op(err.to_string(), "initialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = SyncError::transient("database is locked");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"TransientInfra\""));
        assert!(json.contains("database is locked"));
        assert!(!json.contains("operation"));
    }

    #[test]
    fn test_configuration_not_found_for_carries_coordinates() {
        let err = SyncError::configuration_not_found_for("org/repo", "main");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"repo\":\"org/repo\""));
        assert!(json.contains("\"branch\":\"main\""));
        assert!(err.is_configuration_not_found());
    }

    #[test]
    fn test_only_infra_errors_are_transient() {
        assert!(SyncError::transient("busy").is_transient());
        assert!(SyncError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!SyncError::handler_fault("boom").is_transient());
        assert!(!SyncError::payload_malformed("bad json").is_transient());
        assert!(!SyncError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_display_impl() {
        let err = SyncError::retry_budget_exceeded("req-1", 3);
        assert_eq!(
            err.to_string(),
            "Retry budget exceeded for request req-1 after 3 retries"
        );
    }
}
