use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use mongodb::error::{ErrorKind, WriteFailure};
use serde_json::json;

/// Every failure the core surfaces to callers. Validation and not-found
/// errors are user-facing and never retried; conflicts during identity
/// creation are recovered internally and only surface if the recovery
/// lookup also misses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("database operation timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ApiError::InvalidState(message.into())
    }

    /// True when the underlying driver error is a unique-index violation
    /// (Mongo error code 11000), the signal for the create-user race.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            ApiError::Database(err) => match err.kind.as_ref() {
                ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == 11000,
                _ => false,
            },
            _ => false,
        }
    }

    /// Rewrites a unique-index violation into a caller-facing conflict;
    /// every other error passes through unchanged. Used where a pre-write
    /// availability check can lose a race to the index itself.
    pub fn conflict_on_duplicate(self, message: &str) -> ApiError {
        if self.is_duplicate_key() {
            ApiError::conflict(message)
        } else {
            self
        }
    }
}

impl From<bson::ser::Error> for ApiError {
    fn from(err: bson::ser::Error) -> Self {
        ApiError::Database(err.into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ApiError::Database(err) = self {
            tracing::error!(error = %err, "database error");
        }
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_http() {
        assert_eq!(
            ApiError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("missing").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::conflict("taken").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::invalid_state("done").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn non_database_errors_are_not_duplicate_keys() {
        assert!(!ApiError::conflict("taken").is_duplicate_key());
        assert!(!ApiError::Timeout.is_duplicate_key());
    }

    #[test]
    fn conflict_on_duplicate_passes_other_errors_through() {
        assert!(matches!(
            ApiError::Timeout.conflict_on_duplicate("taken"),
            ApiError::Timeout
        ));
        assert!(matches!(
            ApiError::not_found("missing").conflict_on_duplicate("taken"),
            ApiError::NotFound(_)
        ));
    }
}
