use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::client::{OutboundRequest, RateLimitedClient};
use super::config::OsuApiConfig;
use super::error::{GatewayError, GatewayResult};
use super::limiter::SharedLimiter;
use super::models::{
    normalize_cursor, BeatmapsResponse, BeatmapsetListing, BeatmapsetSearchResponse, Page,
    ScoresResponse, UsersResponse,
};
use super::token::{ClientCredentials, TokenManager};
use crate::database_ops::models::{Beatmap, Mode, Score, User};

/// Upper bound of ids accepted by the batch lookup endpoints.
pub const MAX_BATCH_IDS: usize = 50;
/// Leaderboard size requested per beatmap.
pub const LEADERBOARD_LIMIT: u32 = 100;

/// Typed osu! API v2 operations.
///
/// Feed, search and leaderboard traffic go through `feed`; batch lookups go
/// through `batch`, which is the same client unless a dedicated batch rate was
/// configured.
pub struct OsuApi {
    feed: RateLimitedClient,
    batch: RateLimitedClient,
    tokens: Arc<TokenManager>,
    api_base: String,
    content_base: String,
}

impl OsuApi {
    pub fn new(cfg: &OsuApiConfig) -> GatewayResult<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|source| GatewayError::Transport {
                endpoint: "client-builder".into(),
                source,
            })?;
        let shared = Arc::new(SharedLimiter::new(&cfg.limiter));
        let feed = RateLimitedClient::new(http.clone(), shared, cfg.api_version.clone());
        let batch = match cfg.batch_limiter.as_ref() {
            Some(batch_cfg) => RateLimitedClient::new(
                http,
                Arc::new(SharedLimiter::new(batch_cfg)),
                cfg.api_version.clone(),
            ),
            None => feed.clone(),
        };
        let source = ClientCredentials::new(
            feed.clone(),
            &cfg.token_url,
            cfg.client_id.clone(),
            cfg.client_secret.clone(),
        )?;
        Ok(Self {
            feed,
            batch,
            tokens: Arc::new(TokenManager::new(Arc::new(source))),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            content_base: cfg.content_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = OsuApiConfig::from_env()?;
        debug!(config = ?cfg, "building osu! api gateway");
        Ok(Self::new(&cfg)?)
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn url(base: &str, path: &str) -> GatewayResult<Url> {
        let raw = format!("{base}/{}", path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| GatewayError::Url(format!("{raw}: {e}")))
    }

    async fn get_authed<T>(
        &self,
        client: &RateLimitedClient,
        url: Url,
        cancel: &CancellationToken,
    ) -> GatewayResult<T>
    where
        T: DeserializeOwned,
    {
        let token = self.tokens.get_valid_token(cancel).await?;
        let res = client
            .execute_json(OutboundRequest::get(url), Some(&token), cancel)
            .await;
        if let Err(err) = &res {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                self.tokens.invalidate();
            }
        }
        res
    }

    /// Ranked beatmapsets, oldest first, one page per call.
    #[instrument(skip(self, cancel))]
    pub async fn search_beatmapsets(
        &self,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Page<BeatmapsetListing>> {
        let mut url = Self::url(&self.api_base, "beatmapsets/search")?;
        url.query_pairs_mut()
            .append_pair("sort", "ranked_asc")
            .append_pair("cursor_string", cursor.unwrap_or_default());
        let resp: BeatmapsetSearchResponse = self.get_authed(&self.feed, url, cancel).await?;
        Ok(Page {
            items: resp.beatmapsets.into_iter().map(|s| s.into_listing()).collect(),
            cursor: normalize_cursor(resp.cursor_string),
        })
    }

    /// Top scores on one beatmap in the given mode.
    #[instrument(skip(self, cancel))]
    pub async fn beatmap_scores(
        &self,
        beatmap_id: i64,
        mode: Option<Mode>,
        legacy_only: bool,
        cancel: &CancellationToken,
    ) -> GatewayResult<Vec<Score>> {
        let mut url = Self::url(&self.api_base, &format!("beatmaps/{beatmap_id}/scores"))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("limit", &LEADERBOARD_LIMIT.to_string())
                .append_pair("legacy_only", if legacy_only { "1" } else { "0" });
            if let Some(mode) = mode {
                q.append_pair("mode", mode.as_str());
            }
        }
        let resp: ScoresResponse = self.get_authed(&self.feed, url, cancel).await?;
        Ok(resp
            .scores
            .into_iter()
            .map(|s| {
                let mut score = s.into_score();
                if score.beatmap_id == 0 {
                    score.beatmap_id = beatmap_id;
                }
                score
            })
            .collect())
    }

    /// Global feed of recently submitted scores.
    #[instrument(skip(self, cancel))]
    pub async fn scores_feed(
        &self,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Page<Score>> {
        let mut url = Self::url(&self.api_base, "scores")?;
        url.query_pairs_mut()
            .append_pair("cursor_string", cursor.unwrap_or_default());
        let resp: ScoresResponse = self.get_authed(&self.feed, url, cancel).await?;
        Ok(Page {
            items: resp.scores.into_iter().map(|s| s.into_score()).collect(),
            cursor: normalize_cursor(resp.cursor_string),
        })
    }

    fn batch_url(&self, path: &str, ids: &[i64]) -> GatewayResult<Url> {
        if ids.is_empty() || ids.len() > MAX_BATCH_IDS {
            return Err(GatewayError::InvalidBatch {
                got: ids.len(),
                max: MAX_BATCH_IDS,
            });
        }
        let mut url = Self::url(&self.api_base, path)?;
        {
            let mut q = url.query_pairs_mut();
            for id in ids {
                q.append_pair("ids[]", &id.to_string());
            }
        }
        Ok(url)
    }

    /// Up to 50 beatmaps by id in one request.
    #[instrument(skip(self, cancel), fields(count = ids.len()))]
    pub async fn beatmaps(&self, ids: &[i64], cancel: &CancellationToken) -> GatewayResult<Vec<Beatmap>> {
        let url = self.batch_url("beatmaps", ids)?;
        let resp: BeatmapsResponse = self.get_authed(&self.batch, url, cancel).await?;
        Ok(resp.beatmaps.into_iter().map(|b| b.into_beatmap()).collect())
    }

    /// Up to 50 users by id in one request.
    #[instrument(skip(self, cancel), fields(count = ids.len()))]
    pub async fn users(&self, ids: &[i64], cancel: &CancellationToken) -> GatewayResult<Vec<User>> {
        let url = self.batch_url("users", ids)?;
        let resp: UsersResponse = self.get_authed(&self.batch, url, cancel).await?;
        Ok(resp.users.into_iter().map(|u| u.into_user()).collect())
    }

    /// Raw `.osu` definition of a beatmap. Served without auth.
    #[instrument(skip(self, cancel))]
    pub async fn beatmap_file(&self, beatmap_id: i64, cancel: &CancellationToken) -> GatewayResult<Bytes> {
        let url = Self::url(&self.content_base, &beatmap_id.to_string())?;
        self.feed
            .execute_bytes(OutboundRequest::get(url), None, cancel)
            .await
    }
}
