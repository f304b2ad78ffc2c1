use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::error::{GatewayError, GatewayResult};
use super::limiter::{Acquisition, SharedLimiter};

pub const API_VERSION_HEADER: &str = "x-api-version";

/// One outbound call, built before a limiter slot is taken.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub json: Option<serde_json::Value>,
}

impl OutboundRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            json: None,
        }
    }

    pub fn post_json(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            json: Some(body),
        }
    }

    fn endpoint(&self) -> String {
        self.url.path().to_string()
    }
}

/// Funnels every request through a shared [`SharedLimiter`].
///
/// Denied acquisitions are retried after the limiter's hint (or the configured
/// fallback) until a slot is granted or `cancel` fires. Non-2xx responses are
/// surfaced as [`GatewayError::Status`] without further retries.
#[derive(Clone)]
pub struct RateLimitedClient {
    http: Client,
    limiter: Arc<SharedLimiter>,
    api_version: String,
}

impl RateLimitedClient {
    pub fn new(http: Client, limiter: Arc<SharedLimiter>, api_version: impl Into<String>) -> Self {
        Self {
            http,
            limiter,
            api_version: api_version.into(),
        }
    }

    pub fn limiter(&self) -> &Arc<SharedLimiter> {
        &self.limiter
    }

    async fn acquire_slot(&self, endpoint: &str, cancel: &CancellationToken) -> GatewayResult<()> {
        loop {
            match self.limiter.acquire(cancel).await? {
                Acquisition::Granted => return Ok(()),
                Acquisition::Denied { retry_after } => {
                    let pause = retry_after.unwrap_or_else(|| self.limiter.fallback_retry());
                    debug!(endpoint, pause_ms = pause.as_millis() as u64, "limiter queue full; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    }
                }
            }
        }
    }

    /// Issue `req` once a slot is granted. `auth` is the bearer token; `None` skips
    /// both the `Authorization` and the API version header.
    pub async fn execute(
        &self,
        req: OutboundRequest,
        auth: Option<&str>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Response> {
        let endpoint = req.endpoint();
        self.acquire_slot(&endpoint, cancel).await?;

        let mut builder = self.http.request(req.method, req.url);
        if let Some(token) = auth {
            builder = builder
                .bearer_auth(token)
                .header(API_VERSION_HEADER, self.api_version.as_str());
        }
        if let Some(body) = req.json.as_ref() {
            builder = builder.json(body);
        }

        let response = tokio::select! {
            res = builder.send() => res.map_err(|source| GatewayError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(endpoint = %endpoint, %status, "upstream returned non-success status");
            return Err(GatewayError::Status {
                endpoint,
                status,
                body,
            });
        }
        Ok(response)
    }

    pub async fn execute_json<T>(
        &self,
        req: OutboundRequest,
        auth: Option<&str>,
        cancel: &CancellationToken,
    ) -> GatewayResult<T>
    where
        T: DeserializeOwned,
    {
        let endpoint = req.endpoint();
        let bytes = self.read_body(&endpoint, self.execute(req, auth, cancel).await?).await?;
        serde_json::from_slice(&bytes).map_err(|source| GatewayError::Decode { endpoint, source })
    }

    pub async fn execute_bytes(
        &self,
        req: OutboundRequest,
        auth: Option<&str>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Bytes> {
        let endpoint = req.endpoint();
        let response = self.execute(req, auth, cancel).await?;
        self.read_body(&endpoint, response).await
    }

    async fn read_body(&self, endpoint: &str, response: Response) -> GatewayResult<Bytes> {
        response.bytes().await.map_err(|source| GatewayError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osu_api::config::LimiterConfig;
    use reqwest::StatusCode;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> RateLimitedClient {
        let limiter = Arc::new(SharedLimiter::new(&LimiterConfig::per_second(50)));
        RateLimitedClient::new(Client::new(), limiter, "20240529")
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{p}", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn authenticated_calls_carry_bearer_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/scores"))
            .and(header("authorization", "Bearer abc"))
            .and(header(API_VERSION_HEADER, "20240529"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let body: serde_json::Value = client()
            .execute_json(
                OutboundRequest::get(url(&server, "/api/v2/scores")),
                Some("abc"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn unauthenticated_calls_skip_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        client()
            .execute(
                OutboundRequest::post_json(url(&server, "/oauth/token"), serde_json::json!({"a": 1})),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("authorization").is_none());
        assert!(received[0].headers.get(API_VERSION_HEADER).is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmaps/1/scores"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client()
            .execute(
                OutboundRequest::get(url(&server, "/api/v2/beatmaps/1/scores")),
                Some("abc"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::Status { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "missing");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_caller_never_reaches_the_network() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client()
            .execute(OutboundRequest::get(url(&server, "/api/v2/scores")), Some("abc"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
