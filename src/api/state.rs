//! Shared state for API handlers and the caller-identity extractor.

use super::error::ApiError;

use crate::engine::Engine;
use crate::observation::Role;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use std::sync::Arc;

const CALLER_ID_HEADER: &str = "x-caller-id";
const CALLER_ROLE_HEADER: &str = "x-caller-role";

pub struct ApiState {
    pub engine: Arc<Engine>,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Authenticated caller, as asserted by the upstream auth layer. Logged with
/// each request; authorization is the auth layer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let id = header(CALLER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {CALLER_ID_HEADER} header")))?;
        let role = header(CALLER_ROLE_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {CALLER_ROLE_HEADER} header")))?
            .parse()
            .map_err(ApiError::bad_request)?;

        Ok(Caller {
            id: id.to_string(),
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::{Request, StatusCode};

    async fn extract(headers: &[(&str, &str)]) -> Result<Caller, ApiError> {
        let mut builder = Request::builder().uri("/subjects/s1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn caller_comes_from_headers() {
        let caller = extract(&[("x-caller-id", "u1"), ("x-caller-role", "caseworker")])
            .await
            .unwrap();
        assert_eq!(caller.id, "u1");
        assert_eq!(caller.role, Role::Caseworker);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized_and_bad_role_is_rejected() {
        let missing = extract(&[("x-caller-role", "parent")]).await.unwrap_err();
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

        let bad = extract(&[("x-caller-id", "u1"), ("x-caller-role", "principal")])
            .await
            .unwrap_err();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    }
}
