//! Bearer token cache with single-flight refresh.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::client::{OutboundRequest, RateLimitedClient};
use super::error::{GatewayError, GatewayResult};

/// Tokens this close to expiry are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> GatewayResult<TokenGrant>;
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// OAuth2 client-credentials grant, sent through the shared limiter without auth headers.
pub struct ClientCredentials {
    client: RateLimitedClient,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(
        client: RateLimitedClient,
        token_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> GatewayResult<Self> {
        let token_url = Url::parse(token_url).map_err(|e| GatewayError::Url(format!("{token_url}: {e}")))?;
        Ok(Self {
            client,
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn fetch(&self, cancel: &CancellationToken) -> GatewayResult<TokenGrant> {
        let body = json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "grant_type": "client_credentials",
            "scope": "public",
        });
        let resp: OAuthTokenResponse = self
            .client
            .execute_json(OutboundRequest::post_json(self.token_url.clone(), body), None, cancel)
            .await?;
        Ok(TokenGrant {
            access_token: resp.access_token,
            expires_in: Duration::from_secs(resp.expires_in),
        })
    }
}

type Flight = Shared<BoxFuture<'static, Result<CachedToken, Arc<GatewayError>>>>;

#[derive(Default)]
struct TokenState {
    cached: Option<CachedToken>,
    inflight: Option<(u64, Flight)>,
    generation: u64,
}

/// Owns the process-wide bearer token.
///
/// Concurrent callers that find no fresh token all await the same refresh; the
/// lock is only held to read or publish state, never across the fetch.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    state: Mutex<TokenState>,
    shutdown: CancellationToken,
}

impl TokenManager {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            state: Mutex::new(TokenState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_flight(&self, state: &mut TokenState) -> (u64, Flight) {
        state.generation += 1;
        let generation = state.generation;
        let source = self.source.clone();
        let shutdown = self.shutdown.clone();
        let flight = async move {
            let started = Instant::now();
            debug!(generation, "refreshing api token");
            let grant = source.fetch(&shutdown).await.map_err(Arc::new)?;
            Ok(CachedToken {
                access_token: grant.access_token,
                expires_at: started + grant.expires_in,
            })
        }
        .boxed()
        .shared();
        state.inflight = Some((generation, flight.clone()));
        (generation, flight)
    }

    /// Cached token if it is still fresh, otherwise the result of a (shared) refresh.
    pub async fn get_valid_token(&self, cancel: &CancellationToken) -> GatewayResult<String> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let (generation, flight) = {
            let mut state = self.lock();
            if let Some(token) = state.cached.as_ref() {
                if token.is_fresh(Instant::now()) {
                    return Ok(token.access_token.clone());
                }
            }
            match state.inflight.as_ref() {
                Some((generation, flight)) => (*generation, flight.clone()),
                None => self.start_flight(&mut state),
            }
        };

        let outcome = tokio::select! {
            res = flight => res,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        {
            let mut state = self.lock();
            if matches!(state.inflight.as_ref(), Some((g, _)) if *g == generation) {
                state.inflight = None;
                match outcome.as_ref() {
                    Ok(token) => {
                        info!(generation, "api token refreshed");
                        state.cached = Some(token.clone());
                    }
                    Err(err) => warn!(generation, error = %err, "api token refresh failed"),
                }
            }
        }

        outcome
            .map(|token| token.access_token)
            .map_err(GatewayError::TokenRefresh)
    }

    /// Drop the cached token so the next caller refreshes.
    pub fn invalidate(&self) {
        self.lock().cached = None;
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osu_api::config::LimiterConfig;
    use crate::osu_api::limiter::SharedLimiter;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(lifetime: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime: Duration::from_secs(3600),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self, _cancel: &CancellationToken) -> GatewayResult<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(GatewayError::Status {
                    endpoint: "/oauth/token".into(),
                    status: StatusCode::UNAUTHORIZED,
                    body: "bad client".into(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("token-{n}"),
                expires_in: self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let source = CountingSource::new(Duration::from_secs(3600));
        let manager = TokenManager::new(source.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(manager.get_valid_token(&cancel), manager.get_valid_token(&cancel));
        assert_eq!(a.unwrap(), "token-1");
        assert_eq!(b.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);

        assert_eq!(manager.get_valid_token(&cancel).await.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_inside_the_expiry_margin() {
        let source = CountingSource::new(Duration::from_secs(120));
        let manager = TokenManager::new(source.clone());
        let cancel = CancellationToken::new();

        assert_eq!(manager.get_valid_token(&cancel).await.unwrap(), "token-1");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.get_valid_token(&cancel).await.unwrap(), "token-1");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.get_valid_token(&cancel).await.unwrap(), "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn refresh_failure_reaches_every_waiter_then_retries() {
        let source = CountingSource::failing();
        let manager = TokenManager::new(source.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(manager.get_valid_token(&cancel), manager.get_valid_token(&cancel));
        for res in [a, b] {
            let err = res.unwrap_err();
            assert!(matches!(err, GatewayError::TokenRefresh(_)));
            assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        }
        assert_eq!(source.calls(), 1);

        assert!(manager.get_valid_token(&cancel).await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn client_credentials_posts_public_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "client_id": "42",
                "grant_type": "client_credentials",
                "scope": "public",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "xyz",
                "expires_in": 86400,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = RateLimitedClient::new(
            reqwest::Client::new(),
            Arc::new(SharedLimiter::new(&LimiterConfig::per_second(10))),
            "20240529",
        );
        let source = ClientCredentials::new(client, &format!("{}/oauth/token", server.uri()), "42", "s3cret")
            .unwrap();
        let grant = source.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(grant.access_token, "xyz");
        assert_eq!(grant.expires_in, Duration::from_secs(86400));
    }
}
