pub mod hit_results;
pub mod mods;

pub use hit_results::{hit_result_table, HitResult, HitResultTable, HitStatistics};
pub use mods::{derive_acronyms, mod_acronym};
