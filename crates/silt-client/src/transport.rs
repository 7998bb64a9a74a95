//! HTTP transport to the sync server
//!
//! The orchestrator and monitor talk to the server only through the
//! [`SyncTransport`] trait, so both can be driven by an in-memory fake
//! in tests.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use silt_core::protocol::{
    PullQuery, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
    SyncStatusResponse, TimestampResponse,
};

use crate::error::{ClientError, Result};

/// Operations the sync server exposes to a client
#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    async fn pull(&self, query: &PullQuery) -> Result<PullResponse>;
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;
    async fn resolve_conflict(&self, request: &ResolveConflictRequest) -> Result<()>;
    async fn status(&self) -> Result<SyncStatusResponse>;
    async fn server_timestamp(&self) -> Result<TimestampResponse>;
    /// Cheap reachability probe; used by the network monitor
    async fn health(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpSyncTransport {
    endpoint: String,
    bearer_token: String,
    client: reqwest::Client,
}

impl HttpSyncTransport {
    pub fn new(
        endpoint: impl Into<String>,
        bearer_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let bearer_token = bearer_token.into().trim().to_string();
        if bearer_token.is_empty() {
            return Err(ClientError::InvalidInput(
                "bearer token must not be empty".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            bearer_token,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&PullQuery>,
    ) -> Result<T> {
        let mut request = self
            .client
            .get(format!("{}{path}", self.endpoint))
            .bearer_auth(&self.bearer_token)
            .header("Accept", "application/json");
        if let Some(query) = query {
            request = request.query(query);
        }

        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{path}", self.endpoint))
            .bearer_auth(&self.bearer_token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        Ok(Self::require_success(response).await?.json::<T>().await?)
    }

    /// Map a non-2xx response to [`ClientError::Api`]; the body is only
    /// read for the error message.
    async fn require_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }
}

impl SyncTransport for HttpSyncTransport {
    async fn pull(&self, query: &PullQuery) -> Result<PullResponse> {
        self.get_json("/v1/sync/pull", Some(query)).await
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.post_json("/v1/sync/push", request).await
    }

    async fn resolve_conflict(&self, request: &ResolveConflictRequest) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/sync/resolve-conflict", self.endpoint))
            .bearer_auth(&self.bearer_token)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await?;
        // Only the status matters; a bare 200 with no body is a success
        Self::require_success(response).await?;
        Ok(())
    }

    async fn status(&self) -> Result<SyncStatusResponse> {
        self.get_json("/v1/sync/status", None).await
    }

    async fn server_timestamp(&self) -> Result<TimestampResponse> {
        self.get_json("/v1/sync/timestamp", None).await
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/v1/sync/health", self.endpoint))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Api {
                status: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return message.trim().to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(ClientError::InvalidInput(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(ClientError::InvalidInput(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_trims_trailing_slash() {
        assert_eq!(
            normalize_endpoint("https://sync.example.com/".to_string()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("sync.example.com".to_string()).is_err());
    }

    #[test]
    fn transport_requires_a_token() {
        assert!(HttpSyncTransport::new(
            "https://sync.example.com",
            "  ",
            Duration::from_secs(10)
        )
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_success_body_passes_the_status_check() {
        let raw = http::Response::builder().status(200).body("").unwrap();
        assert!(HttpSyncTransport::require_success(reqwest::Response::from(raw))
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_status_maps_to_api_error() {
        let raw = http::Response::builder()
            .status(404)
            .body(r#"{"error": "no open conflict for record x"}"#)
            .unwrap();
        let error = HttpSyncTransport::require_success(reqwest::Response::from(raw))
            .await
            .unwrap_err();
        match error {
            ClientError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no open conflict for record x");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn api_error_prefers_structured_body() {
        let message = parse_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"error": "Invalid request: entity_id must not be empty"}"#,
        );
        assert_eq!(message, "Invalid request: entity_id must not be empty");

        let fallback = parse_api_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(fallback, "HTTP 502");
    }
}
