pub mod api;
pub mod database_ops;
pub mod estimator;
pub mod ingest;
pub mod logging;
pub mod normalization;
pub mod orchestrator;
pub mod osu_api;

pub mod util {
    pub mod env;
}
