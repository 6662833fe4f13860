//! Observation ingestion and history.

use super::error::ApiError;
use super::state::{ApiState, Caller};

use crate::observation::{
    AppendOutcome, Domain, Environment, NewObservation, Observation, ObservationPayload,
    Reporter,
};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ObservationRequest {
    subject_id: String,
    domain: Domain,
    environment: Option<Environment>,
    reporter: Reporter,
    timestamp: DateTime<Utc>,
    idempotency_key: String,
    #[serde(default)]
    supersedes: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(super) struct ObservationAcceptedResponse {
    observation_id: String,
    seq: i64,
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    domain: Option<Domain>,
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub(super) struct HistoryResponse {
    subject_id: String,
    observations: Vec<Observation>,
}

/// POST /observations: validate and durably accept one observation.
pub(super) async fn create_observation(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Json(request): Json<ObservationRequest>,
) -> Result<(StatusCode, Json<ObservationAcceptedResponse>), ApiError> {
    let payload = ObservationPayload::from_parts(request.domain, request.payload)?;
    let observation = NewObservation {
        subject_id: request.subject_id,
        environment: request.environment,
        reporter: request.reporter,
        observed_at: request.timestamp,
        idempotency_key: request.idempotency_key,
        supersedes: request.supersedes,
        payload,
    };

    match state.engine.ingest(observation).await? {
        AppendOutcome::Accepted { id, seq } => {
            tracing::debug!(caller_id = %caller.id, role = %caller.role, observation_id = %id, "observation accepted");
            Ok((
                StatusCode::CREATED,
                Json(ObservationAcceptedResponse {
                    observation_id: id,
                    seq,
                }),
            ))
        }
        AppendOutcome::Duplicate { prior_id } => Err(ApiError::duplicate(&prior_id)),
    }
}

/// GET /subjects/{id}/observations: raw history, oldest first.
pub(super) async fn list_observations(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    state.engine.plans().require_subject(&subject_id).await?;
    let observations = state
        .engine
        .observations()
        .list_since(&subject_id, query.domain, query.since)
        .await?;
    Ok(Json(HistoryResponse {
        subject_id,
        observations,
    }))
}
