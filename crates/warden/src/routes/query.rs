//! Filing lookup endpoint.

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use beian_common::{QueryError, QueryPage};
use serde::Deserialize;

use super::ApiError;
use crate::export::records_to_csv;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct QueryParams {
    /// Company name, filing number or domain
    keyword: Option<String>,
    /// 1-based page number
    page: Option<u32>,
}

/// Look up one page of filings
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<QueryPage>, ApiError> {
    let keyword = params
        .keyword
        .ok_or(QueryError::Validation { field: "keyword" })?;
    let page = params.page.unwrap_or(1);

    tracing::debug!(keyword = %keyword, page, "Filing query");
    Ok(Json(state.query.query(&keyword, page).await?))
}

/// Download one page of filings as `{keyword}.csv`; 204 when the page is empty
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let keyword = params
        .keyword
        .ok_or(QueryError::Validation { field: "keyword" })?;
    let page = state.query.query(&keyword, params.page.unwrap_or(1)).await?;

    let Some(csv) = records_to_csv(&page.records)? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    tracing::info!(keyword = %page.keyword, page = page.page, rows = page.records.len(), "Exported filings");

    let disposition = format!(
        "attachment; filename*=UTF-8''{}.csv",
        urlencoding::encode(&page.keyword)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}
