use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pipeline::{PersistSummary, ScorePipeline};
use super::{sleep_or_cancel, IngestConfig};
use crate::database_ops::models::Beatmap;

/// Walks ranked beatmapsets oldest first and ingests each difficulty's
/// leaderboard. Starts over once the search runs out of pages.
pub struct LeaderboardCrawler {
    pipeline: Arc<ScorePipeline>,
    concurrency: usize,
    idle_delay: Duration,
    legacy_only: bool,
    max_failures: u32,
    cursor: Option<String>,
    passes: u64,
}

impl LeaderboardCrawler {
    pub fn new(pipeline: Arc<ScorePipeline>, cfg: &IngestConfig) -> Self {
        Self {
            pipeline,
            concurrency: cfg.crawl_concurrency.max(1),
            idle_delay: cfg.crawl_idle_delay,
            legacy_only: cfg.legacy_only,
            max_failures: cfg.max_consecutive_failures.max(1),
            cursor: None,
            passes: 0,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Completed passes over the whole search.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Fetch one search page and ingest every leaderboard on it. The cursor moves
    /// as soon as the page is fetched; a failing leaderboard is logged and counted.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<PersistSummary> {
        let page = self
            .pipeline
            .api()
            .search_beatmapsets(self.cursor.as_deref(), cancel)
            .await?;
        match page.cursor {
            Some(next) => self.cursor = Some(next),
            None => {
                self.cursor = None;
                self.passes += 1;
                info!(passes = self.passes, "beatmapset search exhausted; restarting from the beginning");
            }
        }

        let mut seen = HashSet::new();
        let mut beatmaps: Vec<Beatmap> = page
            .items
            .into_iter()
            .flat_map(|listing| listing.beatmaps)
            .filter(|b| seen.insert(b.id))
            .collect();
        self.pipeline
            .store()
            .create_many(&mut beatmaps)
            .await
            .context("persisting crawled beatmaps")?;

        let pipeline = &self.pipeline;
        let legacy_only = self.legacy_only;
        let results: Vec<(i64, Result<PersistSummary>)> = stream::iter(beatmaps.iter().map(|b| (b.id, b.mode)).collect::<Vec<_>>())
            .map(|(id, mode)| async move {
                let outcome = async {
                    let scores = pipeline
                        .api()
                        .beatmap_scores(id, Some(mode), legacy_only, cancel)
                        .await
                        .with_context(|| format!("leaderboard for beatmap {id}"))?;
                    pipeline.persist_scores(scores, cancel).await
                }
                .await;
                (id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        if cancel.is_cancelled() {
            bail!("crawl cancelled");
        }

        let mut summary = PersistSummary::default();
        for (beatmap_id, result) in results {
            match result {
                Ok(part) => summary.absorb(part),
                Err(e) => {
                    warn!(beatmap_id, error = ?e, "leaderboard skipped");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Loop until cancelled. Gives up with an error after `max_failures`
    /// consecutive failed iterations so the supervisor can restart or fail it.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(concurrency = self.concurrency, "leaderboard crawl starting");
        let mut failures = 0u32;
        loop {
            match self.run_once(&cancel).await {
                Ok(summary) => {
                    failures = 0;
                    info!(
                        received = summary.received,
                        inserted = summary.inserted,
                        failed = summary.failed,
                        "crawl iteration done"
                    );
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_failures {
                        return Err(e.context(format!("crawl failed {failures} iterations in a row")));
                    }
                    warn!(error = ?e, failures, "crawl iteration failed; retrying next iteration");
                }
            }
            if !sleep_or_cancel(self.idle_delay, &cancel).await {
                break;
            }
        }
        info!("leaderboard crawl stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::models::{Beatmapset, Score};
    use crate::ingest::testing::{api, pipeline, score_json, user_json};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn search_page(cursor: Option<&str>) -> serde_json::Value {
        json!({
            "beatmapsets": [{
                "id": 1, "artist": "a", "title": "t",
                "beatmaps": [
                    {"id": 10, "beatmapset_id": 1, "mode": "osu", "status": "ranked"},
                    {"id": 11, "beatmapset_id": 1, "mode": "taiko", "status": "ranked"}
                ]
            }],
            "cursor_string": cursor
        })
    }

    async fn mount_users(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/v2/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": [user_json(2, Some("PL"))]})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn crawls_each_leaderboard_in_its_own_mode_and_restarts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(search_page(None)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmaps/10/scores"))
            .and(query_param("mode", "osu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scores": [score_json(100, 10, 2, Some(50.0))]})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmaps/11/scores"))
            .and(query_param("mode", "taiko"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scores": [score_json(101, 11, 2, Some(60.0))]})))
            .expect(1)
            .mount(&server)
            .await;
        mount_users(&server).await;

        let (pipeline, store) = pipeline(api(&server).await);
        let mut crawler = LeaderboardCrawler::new(pipeline, &IngestConfig::default());
        let summary = crawler.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.beatmaps_fetched, 0);
        assert!(store.get::<Beatmapset>(1).await.unwrap().is_some());
        assert!(store.get::<Score>(101).await.unwrap().is_some());
        assert_eq!(crawler.cursor(), None);
        assert_eq!(crawler.passes(), 1);
    }

    #[tokio::test]
    async fn failing_leaderboard_does_not_pin_the_crawl_to_its_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .and(query_param("cursor_string", ""))
            .respond_with(ResponseTemplate::new(200).set_body_json(search_page(Some("next"))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .and(query_param("cursor_string", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"beatmapsets": [], "cursor_string": null})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmaps/10/scores"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scores": [score_json(100, 10, 2, Some(50.0))]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmaps/11/scores"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_users(&server).await;

        let (pipeline, store) = pipeline(api(&server).await);
        let mut crawler = LeaderboardCrawler::new(pipeline, &IngestConfig::default());
        let cancel = CancellationToken::new();

        let first = crawler.run_once(&cancel).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.inserted, 1);
        assert!(store.get::<Score>(100).await.unwrap().is_some());
        assert_eq!(crawler.cursor(), Some("next"));

        crawler.run_once(&cancel).await.unwrap();
        assert_eq!(crawler.cursor(), None);
        assert_eq!(crawler.passes(), 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_consecutive_failed_searches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let (pipeline, _) = pipeline(api(&server).await);
        let cfg = IngestConfig {
            max_consecutive_failures: 3,
            ..IngestConfig::default()
        };
        let mut crawler = LeaderboardCrawler::new(pipeline, &cfg);

        let err = crawler.run(CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("3 iterations in a row"));
    }
}
