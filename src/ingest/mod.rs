//! Background ingestion: the shared persist pipeline and the two polling loops.
pub mod crawl;
pub mod feed;
pub mod pipeline;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::util::env::{env_flag, env_parse, env_secs};

pub use crawl::LeaderboardCrawler;
pub use feed::ScoreFeedWorker;
pub use pipeline::{PersistSummary, ScorePipeline};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub feed_start_delay: Duration,
    /// Pause between feed iterations; zero polls back to back.
    pub feed_idle_delay: Duration,
    pub crawl_enabled: bool,
    /// Leaderboards fetched at once per crawled page.
    pub crawl_concurrency: usize,
    pub crawl_idle_delay: Duration,
    pub legacy_only: bool,
    /// Failed iterations in a row before a loop returns an error to its supervisor.
    pub max_consecutive_failures: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            feed_start_delay: Duration::from_secs(10),
            feed_idle_delay: Duration::from_secs(45),
            crawl_enabled: true,
            crawl_concurrency: 4,
            crawl_idle_delay: Duration::ZERO,
            legacy_only: false,
            max_consecutive_failures: 5,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            feed_start_delay: env_secs("FEED_START_DELAY_SECS", d.feed_start_delay.as_secs()),
            feed_idle_delay: env_secs("FEED_IDLE_DELAY_SECS", d.feed_idle_delay.as_secs()),
            crawl_enabled: env_flag("CRAWL_ENABLED", d.crawl_enabled),
            crawl_concurrency: env_parse("CRAWL_CONCURRENCY", d.crawl_concurrency).max(1),
            crawl_idle_delay: env_secs("CRAWL_IDLE_DELAY_SECS", d.crawl_idle_delay.as_secs()),
            legacy_only: env_flag("CRAWL_LEGACY_ONLY", d.legacy_only),
            max_consecutive_failures: env_parse("INGEST_MAX_CONSECUTIVE_FAILURES", d.max_consecutive_failures).max(1),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` when cancelled.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_stops_early_on_cancel() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let waiter = tokio::spawn(async move { sleep_or_cancel(Duration::from_secs(3600), &child).await });
        cancel.cancel();
        assert!(!waiter.await.unwrap());
        assert!(sleep_or_cancel(Duration::from_secs(1), &CancellationToken::new()).await);
    }
}
