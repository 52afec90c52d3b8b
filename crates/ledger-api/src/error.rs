//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Errors a handler can return. Rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Core(ledger_core::Error),
    Unauthorized(String),
    BadRequest(String),
}

impl From<ledger_core::Error> for ApiError {
    fn from(err: ledger_core::Error) -> Self {
        ApiError::Core(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use ledger_core::Error;

        match self {
            ApiError::Core(err) => match err {
                Error::InvalidCollection(_) | Error::ValidationFailed(_) => {
                    StatusCode::BAD_REQUEST
                }
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::Conflict(_) => StatusCode::CONFLICT,
                Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                Error::Internal(_) | Error::Io(_) | Error::Serialization(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Message shown to the client. Server-side failures get a generic text;
    /// the detail only goes to the log.
    fn public_message(&self) -> String {
        match self {
            ApiError::Core(err) => match self.status() {
                StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
                StatusCode::SERVICE_UNAVAILABLE => "Storage temporarily unavailable".to_string(),
                _ => err.to_string(),
            },
            ApiError::Unauthorized(msg) | ApiError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            if let ApiError::Core(err) = &self {
                error!(
                    subsystem = "api",
                    error_kind = err.kind(),
                    error = %err,
                    "Request failed"
                );
            }
        }

        let body = Json(serde_json::json!({
            "error": self.public_message(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Error;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(Error::InvalidCollection("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(Error::ValidationFailed("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(Error::StorageUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(Error::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Unauthorized("no".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = ApiError::from(Error::Internal("relation \"secret\" does not exist".into()));
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn test_client_error_detail_is_shown() {
        let err = ApiError::from(Error::Conflict("duplicate name".into()));
        assert!(err.public_message().contains("duplicate name"));
    }
}
