//! Administrative rebuilds and health.

use super::error::ApiError;
use super::state::{ApiState, Caller};

use crate::aggregate::RecomputeState;

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub(super) struct RebuildResponse {
    subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    definition_id: Option<String>,
    #[serde(flatten)]
    freshness: RecomputeState,
}

#[derive(Debug, Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    recomputes_in_flight: usize,
}

/// POST /objectives/{id}/rebuild: recompute one goal from the log.
pub(super) async fn rebuild_objective(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(definition_id): Path<String>,
) -> Result<Json<RebuildResponse>, ApiError> {
    tracing::info!(caller_id = %caller.id, role = %caller.role, definition_id, "definition rebuild requested");
    let subject_id = state.engine.rebuild_definition(&definition_id).await?;
    let freshness = state.engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(RebuildResponse {
        subject_id,
        definition_id: Some(definition_id),
        freshness,
    }))
}

/// POST /subjects/{id}/rebuild: drop and recompute all derived state.
pub(super) async fn rebuild_subject(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(subject_id): Path<String>,
) -> Result<Json<RebuildResponse>, ApiError> {
    tracing::info!(caller_id = %caller.id, role = %caller.role, subject_id, "subject rebuild requested");
    state.engine.rebuild_subject(&subject_id).await?;
    let freshness = state.engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(RebuildResponse {
        subject_id,
        definition_id: None,
        freshness,
    }))
}

/// GET /health
pub(super) async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        recomputes_in_flight: state.engine.recomputes_in_flight(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine, objective};
    use crate::observation::Role;
    use crate::plan::DefinitionKind;

    use axum::http::StatusCode;

    fn caller() -> Caller {
        Caller {
            id: "admin".into(),
            role: Role::Caseworker,
        }
    }

    #[tokio::test]
    async fn rebuild_reports_completion() {
        let (engine, _dir) = engine().await;
        let state = Arc::new(ApiState::new(engine.clone()));
        let goal = engine
            .create_goal("s1", DefinitionKind::Objective, &objective())
            .await
            .unwrap();

        let Json(response) =
            rebuild_objective(State(state.clone()), caller(), Path(goal.id.clone()))
                .await
                .unwrap();
        assert_eq!(response.subject_id, "s1");
        assert!(response.freshness.last_computed_at.is_some());

        let missing = rebuild_objective(State(state.clone()), caller(), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let Json(response) = rebuild_subject(State(state.clone()), caller(), Path("s1".into()))
            .await
            .unwrap();
        assert!(response.definition_id.is_none());

        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
    }
}
