//! Router assembly and the HTTP listener.

use super::state::ApiState;
use super::{admin, definitions, observations, query};

use anyhow::Context as _;
use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

use std::future::Future;
use std::sync::Arc;

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        // writes
        .route("/observations", post(observations::create_observation))
        .route("/subjects", post(definitions::create_subject))
        .route("/subjects/{id}", get(definitions::get_subject))
        .route("/subjects/{id}/routines", post(definitions::create_routine))
        .route("/subjects/{id}/skills", post(definitions::create_skill))
        .route("/subjects/{id}/objectives", post(definitions::create_objective))
        .route("/definitions/{id}", put(definitions::update_definition))
        // reads
        .route("/subjects/{id}/definitions", get(definitions::list_definitions))
        .route("/subjects/{id}/observations", get(observations::list_observations))
        .route("/subjects/{id}/metrics", get(query::metrics))
        .route("/subjects/{id}/patterns", get(query::patterns))
        .route(
            "/subjects/{id}/objectives/{goal_id}/milestones",
            get(query::milestones),
        )
        .route("/subjects/{id}/insights", get(query::insights))
        // admin
        .route("/objectives/{id}/rebuild", post(admin::rebuild_objective))
        .route("/subjects/{id}/rebuild", post(admin::rebuild_subject))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<ApiState>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
    tracing::info!(address = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}
