//! Subjects and care-plan definitions.

use super::error::ApiError;
use super::state::{ApiState, Caller};

use crate::aggregate::RecomputeState;
use crate::plan::{
    Definition, DefinitionKind, DefinitionUpdate, GoalDefinition, NewGoal, NewRoutine,
    NewSubject, RoutineDefinition, Subject,
};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub(super) struct SubjectResponse {
    #[serde(flatten)]
    subject: Subject,
    #[serde(flatten)]
    freshness: RecomputeState,
}

#[derive(Debug, Serialize)]
pub(super) struct DefinitionsResponse {
    subject_id: String,
    definitions: Vec<Definition>,
}

/// POST /subjects
pub(super) async fn create_subject(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Json(request): Json<NewSubject>,
) -> Result<(StatusCode, Json<Subject>), ApiError> {
    let subject = state.engine.register_subject(&request).await?;
    tracing::debug!(caller_id = %caller.id, role = %caller.role, subject_id = %subject.id, "subject created via api");
    Ok((StatusCode::CREATED, Json(subject)))
}

/// GET /subjects/{id}
pub(super) async fn get_subject(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
) -> Result<Json<SubjectResponse>, ApiError> {
    let subject = state.engine.plans().require_subject(&subject_id).await?;
    let freshness = state.engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(SubjectResponse { subject, freshness }))
}

/// GET /subjects/{id}/definitions
pub(super) async fn list_definitions(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
) -> Result<Json<DefinitionsResponse>, ApiError> {
    state.engine.plans().require_subject(&subject_id).await?;
    let definitions = state.engine.plans().list_definitions(&subject_id).await?;
    Ok(Json(DefinitionsResponse {
        subject_id,
        definitions,
    }))
}

/// POST /subjects/{id}/routines
pub(super) async fn create_routine(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(subject_id): Path<String>,
    Json(request): Json<NewRoutine>,
) -> Result<(StatusCode, Json<RoutineDefinition>), ApiError> {
    let routine = state.engine.create_routine(&subject_id, &request).await?;
    tracing::debug!(caller_id = %caller.id, routine_id = %routine.id, "routine created via api");
    Ok((StatusCode::CREATED, Json(routine)))
}

/// POST /subjects/{id}/skills
pub(super) async fn create_skill(
    state: State<Arc<ApiState>>,
    caller: Caller,
    subject_id: Path<String>,
    request: Json<NewGoal>,
) -> Result<(StatusCode, Json<GoalDefinition>), ApiError> {
    create_goal(state, caller, subject_id, DefinitionKind::Skill, request).await
}

/// POST /subjects/{id}/objectives
pub(super) async fn create_objective(
    state: State<Arc<ApiState>>,
    caller: Caller,
    subject_id: Path<String>,
    request: Json<NewGoal>,
) -> Result<(StatusCode, Json<GoalDefinition>), ApiError> {
    create_goal(state, caller, subject_id, DefinitionKind::Objective, request).await
}

async fn create_goal(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(subject_id): Path<String>,
    kind: DefinitionKind,
    Json(request): Json<NewGoal>,
) -> Result<(StatusCode, Json<GoalDefinition>), ApiError> {
    let goal = state.engine.create_goal(&subject_id, kind, &request).await?;
    tracing::debug!(caller_id = %caller.id, goal_id = %goal.id, %kind, "goal created via api");
    Ok((StatusCode::CREATED, Json(goal)))
}

/// PUT /definitions/{id}
pub(super) async fn update_definition(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(definition_id): Path<String>,
    Json(update): Json<DefinitionUpdate>,
) -> Result<Json<Definition>, ApiError> {
    let definition = state
        .engine
        .update_definition(&definition_id, &update)
        .await?;
    tracing::debug!(caller_id = %caller.id, definition_id, "definition updated via api");
    Ok(Json(definition))
}
