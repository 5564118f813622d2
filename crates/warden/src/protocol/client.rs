//! Remote challenge/verification/query API.
//!
//! The engine talks to the remote side through [`ChallengeApi`] and
//! [`QueryApi`]; [`IcpClient`] is the reqwest implementation. Each client owns
//! its own header set, there is no process-wide session.

use anyhow::Context;
use async_trait::async_trait;
use beian_common::constants::{QUERY_PAGE_SIZE, endpoints, headers};
use beian_common::{QueryError, TransportError};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::config::ApiConfig;

/// Challenge material issued for one acquisition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Challenge id; becomes the credential id once signed
    pub uuid: String,

    /// Per-challenge AES key for the point payload
    pub secret_key: String,

    /// Base64 background with the clickable regions
    pub big_image: String,

    /// Base64 reference strip showing the targets in click order
    #[serde(default)]
    pub small_image: Option<String>,

    /// Targets named as text instead of a reference strip
    #[serde(default, deserialize_with = "null_as_empty")]
    pub word_list: Vec<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Submission of a solved challenge
#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest<'a> {
    /// Challenge id (the wire calls it `token`)
    #[serde(rename = "token")]
    pub challenge_id: &'a str,
    #[serde(rename = "secretKey")]
    pub secret_key: &'a str,
    #[serde(rename = "clientUid")]
    pub client_uid: &'a str,
    #[serde(rename = "pointJson")]
    pub point_json: &'a str,
    /// Authentication token, sent as a header
    #[serde(skip)]
    pub auth_token: &'a str,
}

/// Verification outcome as reported by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResponse {
    pub code: i64,
    pub msg: String,
    pub sign: Option<String>,
}

/// One business query page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub page_num: u32,
    pub unit_name: String,
    pub service_type: String,
    pub token: String,
    pub sign: String,
    pub uuid: String,
    pub rci: Option<String>,
}

impl QueryRequest {
    /// Reject requests missing a field the remote side requires
    pub fn validate(&self) -> Result<(), QueryError> {
        let required = [
            ("unitName", &self.unit_name),
            ("serviceType", &self.service_type),
            ("token", &self.token),
            ("sign", &self.sign),
            ("uuid", &self.uuid),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(QueryError::Validation { field });
            }
        }
        if self.page_num == 0 {
            return Err(QueryError::Validation { field: "pageNum" });
        }
        Ok(())
    }
}

/// Raw query response
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub code: i64,
    pub msg: String,
    pub params: serde_json::Value,
    /// Rotating continuation value from the `rci` response header
    pub rci: Option<String>,
}

#[async_trait]
pub trait ChallengeApi: Send + Sync {
    /// Exchange the time-based keyed hash for an authentication token
    async fn authenticate(&self, auth_key: &str, timestamp: &str) -> Result<String, TransportError>;

    /// Request challenge material under `client_uid`
    async fn fetch_challenge(&self, token: &str, client_uid: &str)
    -> Result<Challenge, TransportError>;

    /// Submit encrypted points for verification
    async fn verify(&self, request: &VerifyRequest<'_>) -> Result<VerifyResponse, TransportError>;
}

#[async_trait]
pub trait QueryApi: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default = "Option::default")]
    params: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AuthParams {
    bussiness: String,
}

#[derive(Debug, Deserialize)]
struct SignParams {
    #[serde(default)]
    sign: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    page_num: u32,
    page_size: u32,
    unit_name: &'a str,
    service_type: &'a str,
}

/// reqwest-backed client for the ICP filing query API
pub struct IcpClient {
    http: reqwest::Client,
    base_url: String,
}

impl IcpClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .default_headers(common_headers())
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            http: builder.build().context("Failed to build HTTP client")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Browser session headers the remote side expects on every request.
/// `Accept-Encoding` is left to reqwest so it can decode what it asked for.
fn common_headers() -> HeaderMap {
    headers::BROWSER
        .iter()
        .map(|&(name, value)| (HeaderName::from_static(name), HeaderValue::from_static(value)))
        .collect()
}

fn http_error(e: reqwest::Error) -> TransportError {
    TransportError::Http(e.to_string())
}

/// Read a JSON envelope, failing on non-success status
async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Envelope<T>, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    let body = response.bytes().await.map_err(http_error)?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn require_params<T>(envelope: Envelope<T>, what: &str) -> Result<T, TransportError> {
    envelope.params.ok_or_else(|| {
        TransportError::Malformed(format!(
            "{what} response carried no params (code {:?}, msg {:?})",
            envelope.code, envelope.msg
        ))
    })
}

#[async_trait]
impl ChallengeApi for IcpClient {
    async fn authenticate(&self, auth_key: &str, timestamp: &str) -> Result<String, TransportError> {
        let response = self
            .http
            .post(self.url(endpoints::AUTH))
            .form(&[("authKey", auth_key), ("timeStamp", timestamp)])
            .send()
            .await
            .map_err(http_error)?;

        let envelope: Envelope<AuthParams> = read_envelope(response).await?;
        Ok(require_params(envelope, "auth")?.bussiness)
    }

    async fn fetch_challenge(
        &self,
        token: &str,
        client_uid: &str,
    ) -> Result<Challenge, TransportError> {
        let response = self
            .http
            .post(self.url(endpoints::CHALLENGE))
            .header(headers::TOKEN, token)
            .json(&serde_json::json!({ "clientUid": client_uid }))
            .send()
            .await
            .map_err(http_error)?;

        let envelope: Envelope<Challenge> = read_envelope(response).await?;
        require_params(envelope, "challenge")
    }

    async fn verify(&self, request: &VerifyRequest<'_>) -> Result<VerifyResponse, TransportError> {
        let response = self
            .http
            .post(self.url(endpoints::VERIFY))
            .header(headers::TOKEN, request.auth_token)
            .json(request)
            .send()
            .await
            .map_err(http_error)?;

        let envelope: Envelope<SignParams> = read_envelope(response).await?;
        Ok(VerifyResponse {
            code: envelope.code.unwrap_or_default(),
            msg: envelope.msg.unwrap_or_default(),
            sign: envelope.params.and_then(|p| p.sign),
        })
    }
}

#[async_trait]
impl QueryApi for IcpClient {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        request.validate()?;

        let body = serde_json::to_vec(&QueryBody {
            page_num: request.page_num,
            page_size: QUERY_PAGE_SIZE,
            unit_name: &request.unit_name,
            service_type: &request.service_type,
        })
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut builder = self
            .http
            .post(self.url(endpoints::QUERY))
            .header(headers::TOKEN, &request.token)
            .header(headers::SIGN, &request.sign)
            .header(headers::UUID, &request.uuid)
            .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .body(body);
        if let Some(rci) = request.rci.as_deref().filter(|r| !r.is_empty()) {
            builder = builder.header(headers::RCI, rci);
        }

        let response = builder.send().await.map_err(http_error)?;
        let status = response.status();
        let rci = response
            .headers()
            .get(headers::RCI)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(http_error)?;

        // The remote side reports rejections in the JSON body, often with a
        // non-2xx status; only a non-JSON body is a transport failure
        let envelope: Envelope<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(TransportError::Status(status.as_u16()).into());
            }
            Err(e) => return Err(TransportError::Malformed(e.to_string()).into()),
        };

        Ok(QueryResponse {
            code: envelope.code.unwrap_or(i64::from(status.as_u16())),
            msg: envelope.msg.unwrap_or_default(),
            params: envelope.params.unwrap_or(serde_json::Value::Null),
            rci,
        })
    }
}
