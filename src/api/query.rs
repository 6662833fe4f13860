//! Read-only views over materialized results. Nothing here computes; each
//! response carries when the subject was last recomputed so staleness is
//! visible to the caller.

use super::error::ApiError;
use super::state::{ApiState, Caller};

use crate::aggregate::{MetricSnapshot, RecomputeState};
use crate::error::Error;
use crate::insights::{Insight, InsightStatus, InsightType};
use crate::milestones::GoalState;
use crate::observation::Domain;
use crate::patterns::PatternReport;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(super) struct MetricsQuery {
    domain: Option<Domain>,
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub(super) struct MetricsResponse {
    subject_id: String,
    #[serde(flatten)]
    freshness: RecomputeState,
    metrics: Vec<MetricSnapshot>,
}

#[derive(Debug, Deserialize)]
pub(super) struct PatternsQuery {
    window: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(super) struct PatternsResponse {
    subject_id: String,
    window_days: u32,
    #[serde(flatten)]
    freshness: RecomputeState,
    /// `None` until the first pattern batch for this window has run.
    report: Option<PatternReport>,
}

#[derive(Debug, Serialize)]
pub(super) struct MilestonesResponse {
    #[serde(flatten)]
    freshness: RecomputeState,
    #[serde(flatten)]
    goal: GoalState,
}

#[derive(Debug, Deserialize)]
pub(super) struct InsightsQuery {
    #[serde(rename = "type")]
    insight_type: Option<InsightType>,
    #[serde(default)]
    status: InsightStatus,
}

#[derive(Debug, Serialize)]
pub(super) struct InsightsResponse {
    subject_id: String,
    #[serde(flatten)]
    freshness: RecomputeState,
    insights: Vec<Insight>,
}

/// GET /subjects/{id}/metrics
pub(super) async fn metrics(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let engine = &state.engine;
    engine.plans().require_subject(&subject_id).await?;

    let metrics = engine
        .snapshots()
        .list(&subject_id, query.domain, query.since)
        .await?;
    let freshness = engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(MetricsResponse {
        subject_id,
        freshness,
        metrics,
    }))
}

/// GET /subjects/{id}/patterns
pub(super) async fn patterns(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
    Query(query): Query<PatternsQuery>,
) -> Result<Json<PatternsResponse>, ApiError> {
    let engine = &state.engine;
    engine.plans().require_subject(&subject_id).await?;

    let window_days = query
        .window
        .unwrap_or_else(|| engine.config().default_pattern_window());
    if !engine.config().pattern_windows_days.contains(&window_days) {
        return Err(ApiError::bad_request(format!(
            "window must be one of {:?}",
            engine.config().pattern_windows_days
        )));
    }

    let report = engine.patterns().load(&subject_id, window_days).await?;
    let freshness = engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(PatternsResponse {
        subject_id,
        window_days,
        freshness,
        report,
    }))
}

/// GET /subjects/{id}/objectives/{goal_id}/milestones
pub(super) async fn milestones(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path((subject_id, goal_id)): Path<(String, String)>,
) -> Result<Json<MilestonesResponse>, ApiError> {
    let engine = &state.engine;
    engine.plans().require_subject(&subject_id).await?;

    let goal = engine
        .milestones()
        .load(&subject_id, &goal_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("goal {goal_id} for subject {subject_id}")))?;
    let freshness = engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(MilestonesResponse { freshness, goal }))
}

/// GET /subjects/{id}/insights
///
/// Insights are superseded per rule, so `type=quality` can return one live
/// row for each quality rule that currently fires.
pub(super) async fn insights(
    State(state): State<Arc<ApiState>>,
    _caller: Caller,
    Path(subject_id): Path<String>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let engine = &state.engine;
    engine.plans().require_subject(&subject_id).await?;

    let insights = engine
        .insights()
        .list(&subject_id, query.insight_type, query.status, Utc::now())
        .await?;
    let freshness = engine.snapshots().recompute_state(&subject_id).await?;
    Ok(Json(InsightsResponse {
        subject_id,
        freshness,
        insights,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine, objective};
    use crate::observation::Role;
    use crate::plan::{DefinitionKind, Level};

    use axum::http::StatusCode;

    fn caller() -> Caller {
        Caller {
            id: "c1".into(),
            role: Role::Caseworker,
        }
    }

    #[tokio::test]
    async fn reads_report_freshness_and_unknown_subjects() {
        let (engine, _dir) = engine().await;
        let state = Arc::new(ApiState::new(engine.clone()));

        let Json(response) = metrics(
            State(state.clone()),
            caller(),
            Path("s1".into()),
            Query(MetricsQuery {
                domain: None,
                since: None,
            }),
        )
        .await
        .unwrap();
        assert!(response.metrics.is_empty());
        assert!(response.freshness.last_computed_at.is_none());

        engine.rebuild_subject("s1").await.unwrap();
        let Json(response) = insights(
            State(state.clone()),
            caller(),
            Path("s1".into()),
            Query(InsightsQuery {
                insight_type: None,
                status: InsightStatus::Active,
            }),
        )
        .await
        .unwrap();
        assert!(response.freshness.last_computed_at.is_some());

        let error = metrics(
            State(state),
            caller(),
            Path("nobody".into()),
            Query(MetricsQuery {
                domain: None,
                since: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn milestones_and_patterns_views() {
        let (engine, _dir) = engine().await;
        let state = Arc::new(ApiState::new(engine.clone()));
        let goal = engine
            .create_goal("s1", DefinitionKind::Objective, &objective())
            .await
            .unwrap();

        let Json(response) = milestones(
            State(state.clone()),
            caller(),
            Path(("s1".into(), goal.id.clone())),
        )
        .await
        .unwrap();
        assert_eq!(response.goal.level, Level::Emerging);
        assert_eq!(response.goal.milestone_count, 4);

        let missing = milestones(
            State(state.clone()),
            caller(),
            Path(("s1".into(), "nope".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let bad_window = patterns(
            State(state),
            caller(),
            Path("s1".into()),
            Query(PatternsQuery { window: Some(7) }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad_window.status, StatusCode::BAD_REQUEST);
    }
}
