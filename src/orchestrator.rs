//! Worker lifecycle: each ingestion loop runs as a supervised tokio task with an
//! observable state and a bounded restart policy.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ingest::{sleep_or_cancel, IngestConfig, LeaderboardCrawler, ScoreFeedWorker, ScorePipeline};
use crate::util::env::{env_parse, env_secs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Restarting { attempt: u32 },
    Stopped,
    /// Gave up after exhausting the restart budget.
    Failed(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    /// Multiplied by the attempt number before each restart.
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_restarts: env_parse("WORKER_MAX_RESTARTS", d.max_restarts),
            backoff: env_secs("WORKER_RESTART_BACKOFF_SECS", d.backoff.as_secs()),
        }
    }
}

pub type WorkerFuture = BoxFuture<'static, Result<()>>;

pub struct WorkerHandle {
    name: &'static str,
    cancel: CancellationToken,
    state: watch::Receiver<WorkerState>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `factory`'s future under supervision. It is called again for every restart.
    pub fn spawn<F>(name: &'static str, policy: RestartPolicy, parent: &CancellationToken, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> WorkerFuture + Send + Sync + 'static,
    {
        let cancel = parent.child_token();
        let (tx, rx) = watch::channel(WorkerState::Starting);
        let task = tokio::spawn(supervise(name, policy, cancel.clone(), tx, factory));
        Self {
            name,
            cancel,
            state: rx,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Cancel the worker and wait for the supervisor to finish.
    pub async fn stop(mut self) -> WorkerState {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(worker = self.name, error = %e, "supervisor task failed");
            }
        }
        self.state()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise<F>(
    name: &'static str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    factory: F,
) where
    F: Fn(CancellationToken) -> WorkerFuture + Send + Sync + 'static,
{
    let mut restarts = 0u32;
    loop {
        state.send_replace(WorkerState::Running);
        info!(worker = name, "worker running");
        let failure = match tokio::spawn(factory(cancel.clone())).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(e) if e.is_panic() => Some("worker panicked".to_string()),
            Err(e) => Some(e.to_string()),
        };
        let reason = match failure {
            Some(reason) if !cancel.is_cancelled() => reason,
            _ => {
                info!(worker = name, "worker stopped");
                state.send_replace(WorkerState::Stopped);
                return;
            }
        };
        if restarts >= policy.max_restarts {
            error!(worker = name, restarts, reason = %reason, "worker failed; restart budget exhausted");
            state.send_replace(WorkerState::Failed(reason));
            return;
        }
        restarts += 1;
        warn!(worker = name, attempt = restarts, reason = %reason, "worker exited; restarting");
        state.send_replace(WorkerState::Restarting { attempt: restarts });
        if !sleep_or_cancel(policy.backoff * restarts, &cancel).await {
            state.send_replace(WorkerState::Stopped);
            return;
        }
    }
}

/// Owns the feed and crawl workers for one process.
pub struct IngestionOrchestrator {
    cancel: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl IngestionOrchestrator {
    pub fn start(
        pipeline: Arc<ScorePipeline>,
        cfg: &IngestConfig,
        policy: RestartPolicy,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let mut workers = Vec::new();

        // Held across restarts so the cursor survives a crashed iteration.
        let feed = Arc::new(Mutex::new(ScoreFeedWorker::new(pipeline.clone(), cfg)));
        workers.push(WorkerHandle::spawn("score_feed", policy, &cancel, move |c| {
            let feed = feed.clone();
            async move { feed.lock().await.run(c).await }.boxed()
        }));

        if cfg.crawl_enabled {
            let crawler = Arc::new(Mutex::new(LeaderboardCrawler::new(pipeline, cfg)));
            workers.push(WorkerHandle::spawn("leaderboard_crawl", policy, &cancel, move |c| {
                let crawler = crawler.clone();
                async move { crawler.lock().await.run(c).await }.boxed()
            }));
        }
        info!(workers = workers.len(), "ingestion started");
        Self { cancel, workers }
    }

    pub fn states(&self) -> Vec<(&'static str, WorkerState)> {
        self.workers.iter().map(|w| (w.name(), w.state())).collect()
    }

    /// Resolves once every worker has stopped or failed.
    pub async fn wait(&self) {
        for worker in &self.workers {
            let mut rx = worker.subscribe();
            let _ = rx.wait_for(WorkerState::is_terminal).await;
        }
    }

    pub async fn shutdown(self) -> Vec<(&'static str, WorkerState)> {
        self.cancel.cancel();
        let mut states = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            let name = worker.name();
            states.push((name, worker.stop().await));
        }
        info!(?states, "ingestion stopped");
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn failing_worker_is_restarted_until_the_budget_runs_out() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = WorkerHandle::spawn("flaky", quick(2), &CancellationToken::new(), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("boom"))
            }
            .boxed()
        });
        let mut rx = handle.subscribe();
        let state = rx.wait_for(WorkerState::is_terminal).await.unwrap().clone();
        assert!(matches!(state, WorkerState::Failed(ref r) if r.contains("boom")));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_worker_comes_back() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = WorkerHandle::spawn("panicky", quick(1), &CancellationToken::new(), move |cancel| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run panics");
                }
                cancel.cancelled().await;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.state(), WorkerState::Running);
        assert_eq!(handle.stop().await, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_every_worker() {
        let parent = CancellationToken::new();
        let handle = WorkerHandle::spawn("idle", quick(3), &parent, |cancel| {
            async move {
                cancel.cancelled().await;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        parent.cancel();
        let mut rx = handle.subscribe();
        let state = rx.wait_for(WorkerState::is_terminal).await.unwrap().clone();
        assert_eq!(state, WorkerState::Stopped);
    }

    async fn requests_to(server: &wiremock::MockServer, route: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }

    #[tokio::test]
    async fn orchestrator_drives_both_loops_and_shuts_down_cleanly() {
        use crate::ingest::testing::{api, pipeline};
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/scores"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scores": [], "cursor_string": "c1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"beatmapsets": [], "cursor_string": null})))
            .mount(&server)
            .await;
        let (pipeline, _) = pipeline(api(&server).await);
        let cfg = IngestConfig {
            feed_start_delay: Duration::ZERO,
            feed_idle_delay: Duration::from_millis(10),
            crawl_idle_delay: Duration::from_millis(10),
            ..IngestConfig::default()
        };
        let orchestrator = IngestionOrchestrator::start(pipeline, &cfg, quick(0), &CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(5), async {
            while requests_to(&server, "/api/v2/scores").await < 2
                || requests_to(&server, "/api/v2/beatmapsets/search").await < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            orchestrator.states(),
            vec![("score_feed", WorkerState::Running), ("leaderboard_crawl", WorkerState::Running)]
        );

        let states = orchestrator.shutdown().await;
        assert_eq!(
            states,
            vec![("score_feed", WorkerState::Stopped), ("leaderboard_crawl", WorkerState::Stopped)]
        );
    }

    #[tokio::test]
    async fn crawler_that_keeps_failing_exhausts_its_restarts() {
        use crate::ingest::testing::{api, pipeline};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/beatmapsets/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (pipeline, _) = pipeline(api(&server).await);
        let cfg = IngestConfig {
            max_consecutive_failures: 2,
            ..IngestConfig::default()
        };
        let crawler = Arc::new(Mutex::new(LeaderboardCrawler::new(pipeline, &cfg)));
        let handle = WorkerHandle::spawn("leaderboard_crawl", quick(1), &CancellationToken::new(), move |c| {
            let crawler = crawler.clone();
            async move { crawler.lock().await.run(c).await }.boxed()
        });

        let mut rx = handle.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(WorkerState::is_terminal))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert!(matches!(state, WorkerState::Failed(ref r) if r.contains("2 iterations in a row")));
        // Two failed iterations per run, one run plus one restart.
        assert_eq!(requests_to(&server, "/api/v2/beatmapsets/search").await, 4);
    }
}
