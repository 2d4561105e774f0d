/// Error types for product-service
///
/// Write-path errors are converted to HTTP responses for API clients.
/// Merge worker errors are logged and routed to the dead-letter topic.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Kafka error: {0}")]
    ConsumeTransport(#[from] rdkafka::error::KafkaError),

    #[error("Store apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Decode(err.to_string())
    }
}

impl ServiceError {
    fn error_type(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found_error",
            ServiceError::Conflict(_) => "conflict_error",
            _ => "server_error",
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::Decode(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Persistence(_)
            | ServiceError::Publish(_)
            | ServiceError::ConsumeTransport(_)
            | ServiceError::Timeout(_)
            | ServiceError::Config(_)
            | ServiceError::Outbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        // Store and broker details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        HttpResponse::build(status).json(serde_json::json!({
            "error": self.error_type(),
            "message": message,
            "status": status.as_u16(),
        }))
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
