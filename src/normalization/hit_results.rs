use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Judgement kinds a score's hit statistics are bucketed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitResult {
    Miss,
    Meh,
    Ok,
    Good,
    Great,
    Perfect,
    LargeBonus,
    SmallBonus,
    SmallTickHit,
    SmallTickMiss,
    LargeTickHit,
    LargeTickMiss,
    SliderTailHit,
}

pub type HitStatistics = BTreeMap<HitResult, u32>;

/// Field-name to [`HitResult`] lookup for upstream statistics payloads.
#[derive(Debug, Default, Clone)]
pub struct HitResultTable {
    aliases: HashMap<String, HitResult>,
}

impl HitResultTable {
    /// Current lazer field names plus the legacy `count_*` spellings.
    pub fn with_defaults() -> Self {
        Self::default()
            .register("miss", HitResult::Miss)
            .register("meh", HitResult::Meh)
            .register("ok", HitResult::Ok)
            .register("good", HitResult::Good)
            .register("great", HitResult::Great)
            .register("perfect", HitResult::Perfect)
            .register("large_bonus", HitResult::LargeBonus)
            .register("small_bonus", HitResult::SmallBonus)
            .register("small_tick_hit", HitResult::SmallTickHit)
            .register("small_tick_miss", HitResult::SmallTickMiss)
            .register("large_tick_hit", HitResult::LargeTickHit)
            .register("large_tick_miss", HitResult::LargeTickMiss)
            .register("slider_tail_hit", HitResult::SliderTailHit)
            .register("count_miss", HitResult::Miss)
            .register("count_50", HitResult::Meh)
            .register("count_100", HitResult::Ok)
            .register("count_katu", HitResult::Good)
            .register("count_300", HitResult::Great)
            .register("count_geki", HitResult::Perfect)
    }

    /// Register or override the result kind for a field name.
    pub fn register(mut self, field: impl Into<String>, result: HitResult) -> Self {
        self.aliases.insert(field.into().to_ascii_lowercase(), result);
        self
    }

    pub fn lookup(&self, field: &str) -> Option<HitResult> {
        self.aliases.get(&field.to_ascii_lowercase()).copied()
    }

    /// Collapse a statistics object into counts per result kind.
    ///
    /// Unknown fields, nulls and non-integer counts are skipped; two aliases of
    /// the same kind are summed.
    pub fn map(&self, payload: &Value) -> HitStatistics {
        let mut out = HitStatistics::new();
        let Some(obj) = payload.as_object() else {
            return out;
        };
        for (field, raw) in obj {
            let Some(result) = self.lookup(field) else {
                debug!(field = %field, "ignoring unmapped statistics field");
                continue;
            };
            let Some(count) = raw.as_u64().and_then(|n| u32::try_from(n).ok()) else {
                continue;
            };
            *out.entry(result).or_insert(0) += count;
        }
        out
    }
}

/// Process-wide default table, built on first use.
pub fn hit_result_table() -> &'static HitResultTable {
    static TABLE: OnceLock<HitResultTable> = OnceLock::new();
    TABLE.get_or_init(HitResultTable::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_lazer_statistics_payload() {
        let stats = hit_result_table().map(&json!({
            "great": 812,
            "ok": 14,
            "miss": 2,
            "large_tick_hit": 40,
            "slider_tail_hit": 120,
        }));
        assert_eq!(stats.get(&HitResult::Great), Some(&812));
        assert_eq!(stats.get(&HitResult::Ok), Some(&14));
        assert_eq!(stats.get(&HitResult::Miss), Some(&2));
        assert_eq!(stats.get(&HitResult::SliderTailHit), Some(&120));
        assert_eq!(stats.len(), 5);
    }

    #[test]
    fn legacy_names_fold_into_the_same_kinds() {
        let stats = hit_result_table().map(&json!({"count_300": 100, "count_miss": 3, "count_geki": 7}));
        assert_eq!(stats.get(&HitResult::Great), Some(&100));
        assert_eq!(stats.get(&HitResult::Miss), Some(&3));
        assert_eq!(stats.get(&HitResult::Perfect), Some(&7));
    }

    #[test]
    fn skips_unknown_fields_and_nulls() {
        let stats = hit_result_table().map(&json!({"great": null, "combo_break": 4, "meh": 1}));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.get(&HitResult::Meh), Some(&1));
    }

    #[test]
    fn allows_custom_alias() {
        let table = HitResultTable::with_defaults().register("IGNORE_HIT", HitResult::Great);
        assert_eq!(table.lookup("ignore_hit"), Some(HitResult::Great));
    }

    #[test]
    fn serialises_as_snake_case_keys() {
        let mut stats = HitStatistics::new();
        stats.insert(HitResult::LargeTickMiss, 3);
        assert_eq!(serde_json::to_value(&stats).unwrap(), json!({"large_tick_miss": 3}));
    }
}
