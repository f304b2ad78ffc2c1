// API server implementation using actix-web

use crate::api::handlers::AppState;
use crate::api::{middleware, routes};
use crate::database_ops::QueryEngine;
use crate::util::env::{env_opt, env_parse_opt};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub allowed_origins: String,
    /// actix worker threads; `None` uses one per core.
    pub workers: Option<usize>,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        crate::util::env::init_env();

        let host = env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match env_opt("API_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("Invalid API_PORT {raw:?}"))?,
            None => 8080,
        };
        let allowed_origins = env_opt("ALLOWED_ORIGINS").unwrap_or_else(|| "*".to_string());
        let workers = env_parse_opt::<usize>("API_WORKERS").filter(|n| *n > 0);

        Ok(Self {
            host,
            port,
            allowed_origins,
            workers,
        })
    }

    /// Serve the read API until the process receives a shutdown signal.
    pub async fn run(self, engine: QueryEngine, store_kind: &'static str) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            store = store_kind,
            "Starting score stats API server"
        );

        let state = web::Data::new(AppState::new(engine, store_kind));
        let allowed_origins = self.allowed_origins.clone();

        let mut server = HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);

            App::new()
                .app_data(state.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(cors)
                .configure(routes::configure_routes)
        });
        if let Some(n) = self.workers {
            server = server.workers(n);
        }
        server
            .bind(&bind_addr)
            .with_context(|| format!("Failed to bind to {}", bind_addr))?
            .run()
            .await
            .context("HTTP server error")?;

        Ok(())
    }
}
