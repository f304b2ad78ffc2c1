use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pipeline::{PersistSummary, ScorePipeline};
use super::{sleep_or_cancel, IngestConfig};

/// Attempts at storing one feed page before the cursor moves past it.
pub const MAX_PAGE_ATTEMPTS: u32 = 3;

/// Polls the global score feed, persisting each page before moving the cursor.
pub struct ScoreFeedWorker {
    pipeline: Arc<ScorePipeline>,
    start_delay: Duration,
    idle_delay: Duration,
    max_failures: u32,
    cursor: Option<String>,
    page_failures: u32,
}

impl ScoreFeedWorker {
    pub fn new(pipeline: Arc<ScorePipeline>, cfg: &IngestConfig) -> Self {
        Self {
            pipeline,
            start_delay: cfg.feed_start_delay,
            idle_delay: cfg.feed_idle_delay,
            max_failures: cfg.max_consecutive_failures.max(1),
            cursor: None,
            page_failures: 0,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch and persist one feed page. The cursor moves once the page is stored,
    /// or once storing it has failed [`MAX_PAGE_ATTEMPTS`] times.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<PersistSummary> {
        let page = self
            .pipeline
            .api()
            .scores_feed(self.cursor.as_deref(), cancel)
            .await?;
        match self.pipeline.persist_scores(page.items, cancel).await {
            Ok(summary) => {
                self.page_failures = 0;
                if let Some(next) = page.cursor {
                    self.cursor = Some(next);
                }
                Ok(summary)
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    self.page_failures += 1;
                    if self.page_failures >= MAX_PAGE_ATTEMPTS {
                        if let Some(next) = page.cursor {
                            warn!(attempts = self.page_failures, next = %next, "giving up on feed page");
                            self.cursor = Some(next);
                        }
                        self.page_failures = 0;
                    }
                }
                Err(e)
            }
        }
    }

    /// Loop until cancelled. Failed iterations are retried after the idle delay;
    /// after `max_failures` in a row the error is handed to the supervisor.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(start_delay = ?self.start_delay, idle_delay = ?self.idle_delay, "score feed starting");
        if !sleep_or_cancel(self.start_delay, &cancel).await {
            return Ok(());
        }
        let mut failures = 0u32;
        loop {
            match self.run_once(&cancel).await {
                Ok(summary) => {
                    failures = 0;
                    info!(
                        received = summary.received,
                        inserted = summary.inserted,
                        cursor = self.cursor.as_deref().unwrap_or(""),
                        "feed iteration done"
                    );
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_failures {
                        return Err(e.context(format!("score feed failed {failures} iterations in a row")));
                    }
                    warn!(error = ?e, failures, "feed iteration failed; retrying next iteration");
                }
            }
            if !sleep_or_cancel(self.idle_delay, &cancel).await {
                break;
            }
        }
        info!("score feed stopped");
        Ok(())
    }
}
