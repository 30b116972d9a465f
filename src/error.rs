use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

/// Process-wide error taxonomy. Every variant carries the message surfaced
/// to the client; the HTTP status code is derived from the variant alone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{0}")]
    ClientError(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Fatal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::ClientError(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric status code, used when a status must be persisted or proxied.
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }
}

impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        EngineError::Fatal(format!("Store error: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::ClientError(format!("Invalid JSON: {}", err))
    }
}

/// The single response constructor: every handler failure funnels through
/// here so a status code is always paired with a `{"message": ...}` body.
pub fn respond(code: StatusCode, body: serde_json::Value) -> Response {
    (code, Json(body)).into_response()
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        respond(
            self.status_code(),
            serde_json::json!({ "message": self.to_string() }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::ClientError("x".into()).code(), 400);
        assert_eq!(EngineError::NotFound("x".into()).code(), 404);
        assert_eq!(EngineError::Conflict("x".into()).code(), 409);
        assert_eq!(EngineError::Unprocessable("x".into()).code(), 422);
        assert_eq!(EngineError::Unavailable("x".into()).code(), 503);
        assert_eq!(EngineError::Timeout("x".into()).code(), 408);
        assert_eq!(EngineError::Fatal("x".into()).code(), 500);
    }

    #[test]
    fn test_message_passthrough() {
        let err = EngineError::NotFound("Collection `books` not found.".to_string());
        assert_eq!(err.to_string(), "Collection `books` not found.");
    }

    #[test]
    fn test_json_error_is_client_error() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: EngineError = bad.unwrap_err().into();
        assert_eq!(err.code(), 400);
    }
}
