//! Modifier acronym derivation.
//!
//! Acronyms are computed once, at ingestion, and stored next to the raw mod list
//! so mod filters never have to look inside settings.
use serde_json::{Map, Value};

use crate::database_ops::models::ScoreMod;

/// Setting key carrying a variable playback rate (DT, HT, NC, DC, ...).
pub const RATE_SETTING: &str = "speed_change";

/// `DT` stays `DT`; `DT` with `{"speed_change": 1.3}` becomes `DT(1.3x)`.
pub fn mod_acronym(acronym: &str, settings: &Map<String, Value>) -> String {
    let base = acronym.trim().to_ascii_uppercase();
    match settings.get(RATE_SETTING).and_then(rate_value) {
        Some(rate) => format!("{base}({}x)", format_rate(rate)),
        None => base,
    }
}

/// Acronyms for `mods`, in the order the mods were applied.
pub fn derive_acronyms(mods: &[ScoreMod]) -> Vec<String> {
    mods.iter()
        .map(|m| mod_acronym(&m.acronym, &m.settings))
        .collect()
}

fn rate_value(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|r: &f64| r.is_finite() && *r > 0.0)
}

fn format_rate(rate: f64) -> String {
    let fixed = format!("{rate:.2}");
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn score_mod(acronym: &str, settings: Value) -> ScoreMod {
        ScoreMod {
            acronym: acronym.into(),
            settings: settings.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn plain_mods_keep_their_acronym() {
        let mods = vec![score_mod("HD", json!({})), score_mod("hr", json!({}))];
        assert_eq!(derive_acronyms(&mods), vec!["HD", "HR"]);
    }

    #[test]
    fn rate_setting_adds_suffix() {
        let mods = vec![
            score_mod("DT", json!({"speed_change": 1.3})),
            score_mod("HT", json!({"speed_change": "0.75"})),
            score_mod("NC", json!({"speed_change": 2.0})),
        ];
        assert_eq!(derive_acronyms(&mods), vec!["DT(1.3x)", "HT(0.75x)", "NC(2x)"]);
    }

    #[test]
    fn unrelated_settings_are_ignored() {
        let mods = vec![score_mod("DA", json!({"approach_rate": 9.5}))];
        assert_eq!(derive_acronyms(&mods), vec!["DA"]);
    }

    #[test]
    fn derivation_is_deterministic_and_ordered() {
        let mods = vec![
            score_mod("HR", json!({})),
            score_mod("DT", json!({"speed_change": 1.5})),
        ];
        assert_eq!(derive_acronyms(&mods), derive_acronyms(&mods));
        assert_eq!(derive_acronyms(&mods), vec!["HR", "DT(1.5x)"]);
    }
}
