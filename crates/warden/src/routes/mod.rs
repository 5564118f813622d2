//! HTTP route handlers for Warden.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use beian_common::{AcquisitionError, QueryError, StoreError};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::export::ExportError;
use crate::state::AppState;

mod credentials;
mod health;
mod query;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Cached filing lookups
        .route("/query", get(query::query))
        .route("/query/export", get(query::export))

        // Credential pool
        .route("/credentials", get(credentials::summary))
        .route("/credentials/acquire", post(credentials::acquire))
        .route("/credentials/{id}", delete(credentials::reject))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": {"kind", "message"}}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self {
            status: status(e.status_code()),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<AcquisitionError> for ApiError {
    fn from(e: AcquisitionError) -> Self {
        Self {
            status: status(e.status_code()),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        tracing::error!(error = %e, "CSV export failure");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "export_error",
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Credential store failure");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "store_error",
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::CredentialBroker;
    use crate::config::ReplenisherConfig;
    use crate::protocol::{FlakyAcquirer, QueryApi, QueryRequest, QueryResponse};
    use crate::query::QueryService;
    use crate::replenisher::Replenisher;
    use crate::store::{CredentialStore, MemoryResultCache};
    use async_trait::async_trait;
    use axum::body::{Body, Bytes, to_bytes};
    use axum::http::{HeaderMap, Request};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Accepts every query and echoes its page number as the total.
    /// The keyword `empty.cn` has no filings.
    struct EchoQueryApi;

    #[async_trait]
    impl QueryApi for EchoQueryApi {
        async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
            request.validate()?;
            let list = if request.unit_name == "empty.cn" {
                json!([])
            } else {
                json!([{"unitName": request.unit_name, "domain": "example.cn"}])
            };
            Ok(QueryResponse {
                code: 200,
                msg: "ok".into(),
                params: json!({"total": request.page_num, "list": list}),
                rci: None,
            })
        }
    }

    pub(crate) fn test_state(dir: &TempDir, acquirer: Arc<FlakyAcquirer>) -> AppState {
        let store = Arc::new(CredentialStore::new(
            dir.path().join("token_cache.json"),
            Duration::from_secs(600),
        ));
        let broker = Arc::new(CredentialBroker::new(
            store.clone(),
            acquirer.clone(),
            3,
            Duration::from_secs(180),
        ));
        let query = Arc::new(QueryService::new(
            broker.clone(),
            Arc::new(EchoQueryApi),
            Arc::new(MemoryResultCache::default()),
            Duration::from_secs(3600),
        ));
        let replenisher = Arc::new(Replenisher::new(store, acquirer, &ReplenisherConfig::default()));

        AppState {
            broker,
            query,
            replenisher,
            replenish_ttl: Duration::from_secs(60),
        }
    }

    pub(crate) async fn send_raw(
        state: AppState,
        method: &str,
        uri: &str,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let response = create_router(state)
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, bytes)
    }

    pub(crate) async fn send(state: AppState, method: &str, uri: &str) -> (StatusCode, Value) {
        let (status, _, bytes) = send_raw(state, method, uri).await;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[test]
    fn test_error_body_shape() {
        let response = ApiError::from(QueryError::Validation { field: "keyword" }).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let exhausted = ApiError::from(AcquisitionError::Exhausted {
            attempts: 5,
            last: Box::new(AcquisitionError::SolvingFailed("short".into())),
        });
        assert_eq!(exhausted.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.kind, "acquisition_exhausted");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = TempDir::new().unwrap();
        let (status, _) = send(test_state(&dir, FlakyAcquirer::new(0)), "GET", "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
