pub mod db;
pub mod filter;
pub mod memory_store;
pub mod models;
pub mod pg_store;
pub mod query;
pub mod store;

pub use db::Db;
pub use filter::{Filter, ScoreSort};
pub use memory_store::MemoryStore;
pub use models::{Beatmap, BeatmapStatus, Beatmapset, Country, Grade, Mode, Score, ScoreMod, User};
pub use pg_store::PgStore;
pub use query::{QueryEngine, ScoreQuery, UserScoreQuery};
pub use store::{EntityUpsertStore, StoreBackend};
