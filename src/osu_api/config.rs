use std::time::Duration;

use crate::util::env::{env_opt, env_parse, env_parse_opt, env_req};

pub const DEFAULT_TOKEN_URL: &str = "https://osu.ppy.sh/oauth/token";
pub const DEFAULT_API_BASE: &str = "https://osu.ppy.sh/api/v2";
pub const DEFAULT_CONTENT_BASE: &str = "https://osu.ppy.sh/osu";
pub const DEFAULT_API_VERSION: &str = "20240529";

/// Token-bucket settings for one limiter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Tokens added per `period`.
    pub tokens_per_period: u32,
    pub period: Duration,
    /// Bucket size; the bucket starts full.
    pub capacity: u32,
    /// Callers allowed to wait for a slot before acquisition is denied.
    pub queue_limit: usize,
    /// Sleep used when a denial carries no retry-after hint.
    pub fallback_retry: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_period: 1,
            period: Duration::from_secs(1),
            capacity: 1,
            queue_limit: 60,
            fallback_retry: Duration::from_secs(1),
        }
    }
}

impl LimiterConfig {
    pub fn per_second(rps: u32) -> Self {
        Self {
            tokens_per_period: rps.max(1),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse_opt::<u32>("OSU_REQS_PER_SEC") {
            cfg.tokens_per_period = n.max(1);
        }
        if let Some(n) = env_parse_opt::<u32>("OSU_BURST") {
            cfg.capacity = n.max(1);
        }
        if let Some(n) = env_parse_opt::<usize>("OSU_QUEUE_LIMIT") {
            cfg.queue_limit = n;
        }
        if let Some(ms) = env_parse_opt::<u64>("OSU_RETRY_FALLBACK_MS") {
            cfg.fallback_retry = Duration::from_millis(ms);
        }
        cfg
    }

    /// Separate limiter for batch lookups, only when `OSU_BATCH_REQS_PER_SEC` is set.
    pub fn batch_from_env() -> Option<Self> {
        let rps = env_parse_opt::<u32>("OSU_BATCH_REQS_PER_SEC")?;
        let base = Self::from_env();
        Some(Self {
            tokens_per_period: rps.max(1),
            capacity: rps.max(base.capacity),
            ..base
        })
    }
}

#[derive(Clone)]
pub struct OsuApiConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub api_base: String,
    pub content_base: String,
    pub api_version: String,
    pub user_agent: String,
    pub limiter: LimiterConfig,
    pub batch_limiter: Option<LimiterConfig>,
}

// Hand-written so the client secret never lands in logs.
impl std::fmt::Debug for OsuApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsuApiConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("token_url", &self.token_url)
            .field("api_base", &self.api_base)
            .field("content_base", &self.content_base)
            .field("api_version", &self.api_version)
            .field("limiter", &self.limiter)
            .field("batch_limiter", &self.batch_limiter)
            .finish()
    }
}

impl OsuApiConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            content_base: DEFAULT_CONTENT_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: "osu-score-stats/0.1".to_string(),
            limiter: LimiterConfig::default(),
            batch_limiter: None,
        }
    }

    /// Points every endpoint at `base` (token, API and raw content); used against mock servers.
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.token_url = format!("{base}/oauth/token");
        self.api_base = format!("{base}/api/v2");
        self.content_base = format!("{base}/osu");
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::new(env_req("OSU_CLIENT_ID")?, env_req("OSU_CLIENT_SECRET")?);
        if let Some(v) = env_opt("OSU_TOKEN_URL") {
            cfg.token_url = v;
        }
        if let Some(v) = env_opt("OSU_API_BASE") {
            cfg.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env_opt("OSU_CONTENT_BASE") {
            cfg.content_base = v.trim_end_matches('/').to_string();
        }
        cfg.api_version = env_parse("OSU_API_VERSION", cfg.api_version);
        cfg.user_agent = env_parse("OSU_USER_AGENT", cfg.user_agent);
        cfg.limiter = LimiterConfig::from_env();
        cfg.batch_limiter = LimiterConfig::batch_from_env();
        Ok(cfg)
    }
}
