//! Error types for localdesk.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Knowledge retrieval errors.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding generation failed: {reason}")]
    EmbeddingFailed { reason: String },

    #[error("Search failed: {reason}")]
    SearchFailed { reason: String },
}

/// Documentation indexing errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Documentation directory not found: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the HTTP layer.
///
/// Each variant maps to a status code and a `{ "error": ... }` JSON body.
/// Provider and database details are logged, never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{variable} not configured")]
    Configuration { variable: String },

    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ApiError {
    /// Construct a 400 error naming the defect.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Construct a 500 error for a missing configuration variable.
    pub fn missing_config(variable: impl Into<String>) -> Self {
        Self::Configuration {
            variable: variable.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Configuration { .. } | Self::Provider(_) | Self::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The message sent to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(_) | Self::Configuration { .. } => self.to_string(),
            Self::Provider(_) => "An error occurred processing your request".to_string(),
            Self::Database(DatabaseError::NotFound { entity, .. }) => format!("{entity} not found"),
            Self::Database(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Provider(e) => tracing::error!(error = %e, "Model provider call failed"),
            Self::Database(DatabaseError::NotFound { entity, id }) => {
                tracing::debug!(entity = %entity, id = %id, "Not found")
            }
            Self::Database(e) => tracing::error!(error = %e, "Database call failed"),
            Self::Configuration { variable } => {
                tracing::error!(variable = %variable, "Missing configuration")
            }
            Self::Validation(msg) => tracing::debug!(reason = %msg, "Rejected request"),
        }
        let body = serde_json::json!({ "error": self.client_message() });
        (self.status(), axum::Json(body)).into_response()
    }
}
