//! Mapping from engine errors to HTTP responses.

use crate::error::Error;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    pub(super) status: StatusCode,
    pub(super) body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            body: json!({ "error": kind, "message": message.to_string() }),
        }
    }

    pub(super) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message.into())
    }

    pub(super) fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message.into())
    }

    /// Idempotent replay of an already-accepted observation.
    pub(super) fn duplicate(prior_id: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            body: json!({ "error": "duplicate_key", "prior_id": prior_id }),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::InvalidPayload(_) | Error::OutOfOrderEvidence { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::UnknownSubject(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RecomputationFailure { .. } | Error::Database(_) | Error::Other(_) => {
                tracing::error!(%error, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut api_error = Self::new(status, error.kind(), &error);
        if let Error::OutOfOrderEvidence {
            milestone_id,
            milestone_level,
            current_level,
        } = &error
        {
            api_error.body["milestone_id"] = json!(milestone_id);
            api_error.body["milestone_level"] = json!(milestone_level);
            api_error.body["current_level"] = json!(current_level);
        }
        api_error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Level;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let invalid = ApiError::from(Error::invalid("rating must be between 1 and 10"));
        assert_eq!(invalid.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(invalid.body["error"], "invalid_payload");

        let unknown = ApiError::from(Error::UnknownSubject("s9".into()));
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);

        let internal = ApiError::from(Error::Other(anyhow::anyhow!("disk full")));
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn out_of_order_evidence_names_the_levels() {
        let error = ApiError::from(Error::OutOfOrderEvidence {
            milestone_id: "p1".into(),
            milestone_level: Level::Proficient,
            current_level: Level::Emerging,
        });
        assert_eq!(error.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error.body["error"], "out_of_order_evidence");
        assert_eq!(error.body["milestone_level"], "proficient");
        assert_eq!(error.body["current_level"], "emerging");
    }
}
