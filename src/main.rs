use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use osu_score_stats::api::ApiServer;
use osu_score_stats::database_ops::{
    Db, EntityUpsertStore, MemoryStore, PgStore, QueryEngine, ScoreQuery, ScoreSort,
};
use osu_score_stats::estimator::HeuristicEstimator;
use osu_score_stats::ingest::{IngestConfig, ScorePipeline};
use osu_score_stats::logging::{init_tracing, DEFAULT_FILTER};
use osu_score_stats::orchestrator::{IngestionOrchestrator, RestartPolicy};
use osu_score_stats::osu_api::OsuApi;
use osu_score_stats::util::env;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "scorestats", version, about = "osu! score ingestion and stats API")]
struct Cli {
    /// Storage backend. `memory` keeps everything in-process and is lost on exit.
    #[arg(long, value_enum, default_value_t = StoreKind::Postgres, global = true)]
    store: StoreKind,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Postgres,
}

impl StoreKind {
    fn label(self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Postgres => "postgres",
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run the score feed and leaderboard crawl until interrupted
    Ingest {
        /// Only follow the global score feed
        #[arg(long, default_value_t = false)]
        no_crawl: bool,
    },
    /// Serve the read API
    Serve,
    /// Ingest and serve from the same process
    Run {
        #[arg(long, default_value_t = false)]
        no_crawl: bool,
    },
    /// Run one score query and print the result as JSON
    Query {
        #[arg(long)]
        mode: Option<String>,
        /// First day included (YYYY-MM-DD, UTC)
        #[arg(long)]
        date_start: Option<NaiveDate>,
        /// Last day included (YYYY-MM-DD, UTC)
        #[arg(long)]
        date_end: Option<NaiveDate>,
        /// ISO country code
        #[arg(long)]
        country: Option<String>,
        #[arg(long, value_delimiter = ',')]
        mandatory_mods: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        optional_mods: Vec<String>,
        #[arg(long)]
        amount: Option<i64>,
        /// pp, total_score, classic_total_score or date
        #[arg(long, default_value = "pp")]
        sort: String,
        #[arg(long, default_value_t = false)]
        ascending: bool,
    },
    /// Apply the embedded schema to DATABASE_URL
    Migrate,
}

async fn open_store(kind: StoreKind) -> Result<EntityUpsertStore> {
    let store = match kind {
        StoreKind::Memory => {
            warn!("using the in-memory store; nothing survives this process");
            EntityUpsertStore::new(Arc::new(MemoryStore::new()))
        }
        StoreKind::Postgres => {
            let db = Db::from_env().await?;
            EntityUpsertStore::new(Arc::new(PgStore::new(db)))
        }
    };
    Ok(store)
}

fn start_ingestion(store: EntityUpsertStore, no_crawl: bool, cancel: &CancellationToken) -> Result<IngestionOrchestrator> {
    env::preflight_check("ingest", &["OSU_CLIENT_ID", "OSU_CLIENT_SECRET"], &["OSU_API_BASE", "OSU_REQS_PER_SEC"])?;
    let api = Arc::new(OsuApi::from_env()?);
    let pipeline = Arc::new(ScorePipeline::new(api, store, Arc::new(HeuristicEstimator)));
    let mut cfg = IngestConfig::from_env();
    if no_crawl {
        cfg.crawl_enabled = false;
    }
    Ok(IngestionOrchestrator::start(pipeline, &cfg, RestartPolicy::from_env(), cancel))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        token.cancel();
    });
}

#[actix_web::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let db = Db::from_env().await?;
            db.run_migrations().await.context("applying schema")?;
        }
        Commands::Ingest { no_crawl } => {
            let store = open_store(cli.store).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let orchestrator = start_ingestion(store, no_crawl, &cancel)?;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = orchestrator.wait() => warn!("every ingestion worker has exited"),
            }
            orchestrator.shutdown().await;
        }
        Commands::Serve => {
            let store = open_store(cli.store).await?;
            ApiServer::from_env()?
                .run(QueryEngine::new(store), cli.store.label())
                .await?;
        }
        Commands::Run { no_crawl } => {
            let store = open_store(cli.store).await?;
            let cancel = CancellationToken::new();
            let orchestrator = start_ingestion(store.clone(), no_crawl, &cancel)?;
            // actix handles the signal and returns once the server has drained.
            let served = ApiServer::from_env()?
                .run(QueryEngine::new(store), cli.store.label())
                .await;
            cancel.cancel();
            orchestrator.shutdown().await;
            served?;
        }
        Commands::Query {
            mode,
            date_start,
            date_end,
            country,
            mandatory_mods,
            optional_mods,
            amount,
            sort,
            ascending,
        } => {
            let query = ScoreQuery {
                mode: mode
                    .as_deref()
                    .map(str::parse)
                    .transpose()
                    .map_err(anyhow::Error::msg)?,
                date_start,
                date_end,
                country,
                mandatory_mods,
                optional_mods,
                amount,
                sort: ScoreSort::parse(&sort).with_context(|| format!("unknown sort {sort:?}"))?,
                descending: Some(!ascending),
            };
            let engine = QueryEngine::new(open_store(cli.store).await?);
            let scores = engine.scores(&query).await?;
            info!(count = scores.len(), "query done");
            println!("{}", serde_json::to_string_pretty(&scores)?);
        }
    }
    Ok(())
}
