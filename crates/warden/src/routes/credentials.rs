//! Credential pool endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use beian_common::Credential;
use serde::Serialize;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct PoolSummary {
    /// Live at the consumer serving TTL
    live_serving: usize,
    /// Live at the replenishment TTL
    live_replenish: usize,
    serve_ttl_secs: u64,
    replenish_ttl_secs: u64,
    replenisher_running: bool,
}

pub async fn summary(State(state): State<AppState>) -> Result<Json<PoolSummary>, ApiError> {
    let store = state.broker.store();
    let serve_ttl = state.broker.serve_ttl();

    Ok(Json(PoolSummary {
        live_serving: store.count_live(serve_ttl).await?,
        live_replenish: store.count_live(state.replenish_ttl).await?,
        serve_ttl_secs: serve_ttl.as_secs(),
        replenish_ttl_secs: state.replenish_ttl.as_secs(),
        replenisher_running: state.replenisher.is_running().await,
    }))
}

/// Run a fresh acquisition and store the result
pub async fn acquire(State(state): State<AppState>) -> Result<Json<Credential>, ApiError> {
    Ok(Json(state.broker.acquire_credential().await?))
}

#[derive(Serialize)]
pub struct RejectResponse {
    removed: bool,
}

/// Report a credential the remote side refused
pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RejectResponse>, ApiError> {
    let removed = state.broker.report_rejected(&id).await?;
    Ok(Json(RejectResponse { removed }))
}
