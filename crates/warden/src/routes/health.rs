//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    result_cache: bool,
    replenisher: bool,
}

/// Readiness check: the result cache must be reachable
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if !state.query.cache().ping().await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        result_cache: true,
        replenisher: state.replenisher.is_running().await,
    }))
}

#[cfg(test)]
mod tests {
    use crate::protocol::FlakyAcquirer;
    use crate::routes::tests::{send, test_state};
    use axum::http::StatusCode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_health_and_ready() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, FlakyAcquirer::new(0));

        let (status, body) = send(state.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(state, "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result_cache"], true);
        assert_eq!(body["replenisher"], false);
    }
}
