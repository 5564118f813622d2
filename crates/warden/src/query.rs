//! Consumer query path: result cache, credential, remote query, write-through.

use beian_common::constants::{QUERY_PAGE_SIZE, WEBSITE_SERVICE_TYPE};
use beian_common::{CredentialPatch, QueryError, QueryPage};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::CredentialBroker;
use crate::protocol::{QueryApi, QueryRequest, QueryResponse};
use crate::store::ResultCache;

pub struct QueryService {
    broker: Arc<CredentialBroker>,
    api: Arc<dyn QueryApi>,
    cache: Arc<dyn ResultCache>,
    result_ttl: Duration,
}

impl QueryService {
    pub fn new(
        broker: Arc<CredentialBroker>,
        api: Arc<dyn QueryApi>,
        cache: Arc<dyn ResultCache>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            api,
            cache,
            result_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.cache
    }

    /// Look up one page of filings for `keyword`
    pub async fn query(&self, keyword: &str, page: u32) -> Result<QueryPage, QueryError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(QueryError::Validation { field: "keyword" });
        }
        if page == 0 {
            return Err(QueryError::Validation { field: "page" });
        }

        match self.cache.load(keyword, page, self.result_ttl).await {
            Ok(Some(cached)) => {
                tracing::debug!(keyword, page, "Serving cached result");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(keyword, page, error = %format!("{e:#}"), "Result cache read failed"),
        }

        let credential = self.broker.credential_for_query().await?;
        let request = QueryRequest {
            page_num: page,
            unit_name: keyword.to_string(),
            service_type: WEBSITE_SERVICE_TYPE.to_string(),
            token: credential.token.clone(),
            sign: credential.sign.clone(),
            uuid: credential.id.clone(),
            rci: credential.rci.clone(),
        };
        let response = self.api.query(&request).await?;

        if response.code != 200 {
            tracing::warn!(
                credential_id = %credential.id,
                code = response.code,
                msg = %response.msg,
                "Query rejected, evicting credential"
            );
            if let Err(e) = self.broker.report_rejected(&credential.id).await {
                tracing::error!(credential_id = %credential.id, error = %e, "Failed to evict credential");
            }
            return Err(QueryError::Rejected {
                code: response.code,
                msg: response.msg,
            });
        }

        if let Some(rci) = response.rci.as_deref() {
            if let Err(e) = self.broker.refresh(&credential.id, CredentialPatch::rci(rci)).await {
                tracing::warn!(credential_id = %credential.id, error = %e, "Failed to attach rci");
            }
        }

        let result = build_page(keyword, page, &response);
        if let Err(e) = self.cache.save(keyword, page, &result).await {
            tracing::warn!(keyword, page, error = %format!("{e:#}"), "Result cache write failed");
        }
        Ok(result)
    }
}

fn build_page(keyword: &str, page: u32, response: &QueryResponse) -> QueryPage {
    let records = response
        .params
        .get("list")
        .and_then(|list| list.as_array())
        .cloned()
        .unwrap_or_default();
    let total = response
        .params
        .get("total")
        .and_then(|total| total.as_u64())
        .unwrap_or(0);

    QueryPage {
        keyword: keyword.to_string(),
        page,
        page_size: QUERY_PAGE_SIZE,
        total,
        records,
    }
}
