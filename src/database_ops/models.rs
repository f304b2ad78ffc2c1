//! Persisted domain entities and their shared enums.
//!
//! Parent references (`Beatmap::beatmapset`, `User::country`, `Score::beatmap`,
//! `Score::user`) are in-memory only. The store strips them before writing and
//! re-points them at the persisted parent after a create or update.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalization::HitStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "WireEnum")]
pub enum Mode {
    Osu,
    Taiko,
    Fruits,
    Mania,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Osu, Mode::Taiko, Mode::Fruits, Mode::Mania];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Osu => "osu",
            Mode::Taiko => "taiko",
            Mode::Fruits => "fruits",
            Mode::Mania => "mania",
        }
    }

    pub fn ruleset_id(self) -> u8 {
        match self {
            Mode::Osu => 0,
            Mode::Taiko => 1,
            Mode::Fruits => 2,
            Mode::Mania => 3,
        }
    }

    pub fn from_ruleset_id(id: i64) -> Option<Self> {
        Some(match id {
            0 => Mode::Osu,
            1 => Mode::Taiko,
            2 => Mode::Fruits,
            3 => Mode::Mania,
            _ => return None,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "osu" | "std" | "standard" => Ok(Mode::Osu),
            "taiko" => Ok(Mode::Taiko),
            "fruits" | "catch" | "ctb" => Ok(Mode::Fruits),
            "mania" => Ok(Mode::Mania),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(Mode::from_ruleset_id)
                .ok_or_else(|| format!("unknown mode {s:?}")),
        }
    }
}

/// Enum that arrives either as its numeric id or as its name.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireEnum {
    Id(i64),
    Name(String),
}

impl TryFrom<WireEnum> for Mode {
    type Error = String;

    fn try_from(raw: WireEnum) -> Result<Self, Self::Error> {
        match raw {
            WireEnum::Id(id) => Mode::from_ruleset_id(id).ok_or_else(|| format!("unknown ruleset id {id}")),
            WireEnum::Name(name) => name.parse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grade {
    F,
    D,
    C,
    B,
    A,
    S,
    Sh,
    X,
    Xh,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::F => "F",
            Grade::D => "D",
            Grade::C => "C",
            Grade::B => "B",
            Grade::A => "A",
            Grade::S => "S",
            Grade::Sh => "SH",
            Grade::X => "X",
            Grade::Xh => "XH",
        }
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "F" => Grade::F,
            "D" => Grade::D,
            "C" => Grade::C,
            "B" => Grade::B,
            "A" => Grade::A,
            "S" => Grade::S,
            "SH" => Grade::Sh,
            "X" => Grade::X,
            "XH" => Grade::Xh,
            _ => return Err(format!("unknown grade {s:?}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "WireEnum")]
pub enum BeatmapStatus {
    Graveyard,
    Wip,
    Pending,
    Ranked,
    Approved,
    Qualified,
    Loved,
}

impl BeatmapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BeatmapStatus::Graveyard => "graveyard",
            BeatmapStatus::Wip => "wip",
            BeatmapStatus::Pending => "pending",
            BeatmapStatus::Ranked => "ranked",
            BeatmapStatus::Approved => "approved",
            BeatmapStatus::Qualified => "qualified",
            BeatmapStatus::Loved => "loved",
        }
    }

    fn from_id(id: i64) -> Option<Self> {
        Some(match id {
            -2 => BeatmapStatus::Graveyard,
            -1 => BeatmapStatus::Wip,
            0 => BeatmapStatus::Pending,
            1 => BeatmapStatus::Ranked,
            2 => BeatmapStatus::Approved,
            3 => BeatmapStatus::Qualified,
            4 => BeatmapStatus::Loved,
            _ => return None,
        })
    }
}

impl FromStr for BeatmapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "graveyard" => BeatmapStatus::Graveyard,
            "wip" => BeatmapStatus::Wip,
            "pending" => BeatmapStatus::Pending,
            "ranked" => BeatmapStatus::Ranked,
            "approved" => BeatmapStatus::Approved,
            "qualified" => BeatmapStatus::Qualified,
            "loved" => BeatmapStatus::Loved,
            _ => return Err(format!("unknown beatmap status {s:?}")),
        })
    }
}

impl TryFrom<WireEnum> for BeatmapStatus {
    type Error = String;

    fn try_from(raw: WireEnum) -> Result<Self, Self::Error> {
        match raw {
            WireEnum::Id(id) => BeatmapStatus::from_id(id).ok_or_else(|| format!("unknown status id {id}")),
            WireEnum::Name(name) => name.parse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beatmapset {
    pub id: i64,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beatmap {
    pub id: i64,
    pub beatmapset_id: i64,
    pub mode: Mode,
    pub difficulty_name: String,
    pub difficulty_rating: f32,
    pub bpm: Option<f32>,
    pub approach_rate: f32,
    pub circle_size: f32,
    pub overall_difficulty: f32,
    pub drain: f32,
    pub status: BeatmapStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beatmapset: Option<Arc<Beatmapset>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RulesetStats {
    pub global_rank: Option<i64>,
    #[serde(default)]
    pub pp: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub country_code: String,
    #[serde(default)]
    pub ruleset_statistics: BTreeMap<Mode, RulesetStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<Arc<Country>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMod {
    pub acronym: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: i64,
    pub legacy_score_id: Option<i64>,
    pub ended_at: DateTime<Utc>,
    pub mode: Mode,
    pub beatmap_id: i64,
    pub user_id: i64,
    pub grade: Grade,
    #[serde(default)]
    pub mods: Vec<ScoreMod>,
    #[serde(default)]
    pub mod_acronyms: Vec<String>,
    pub accuracy: f32,
    pub max_combo: i32,
    #[serde(default)]
    pub statistics: HitStatistics,
    #[serde(default)]
    pub maximum_statistics: HitStatistics,
    pub total_score: i64,
    pub classic_total_score: i64,
    pub legacy_total_score: i64,
    pub pp: Option<f32>,
    /// 1-based position on the beatmap leaderboard, filled per query.
    #[serde(default, skip_deserializing)]
    pub map_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beatmap: Option<Arc<Beatmap>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Arc<User>>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Small builders shared by store, query and pipeline tests.
    use super::*;
    use chrono::TimeZone;

    pub fn beatmapset(id: i64) -> Beatmapset {
        Beatmapset {
            id,
            artist: format!("artist {id}"),
            title: format!("title {id}"),
            preview_url: None,
        }
    }

    pub fn beatmap(id: i64, set: i64) -> Beatmap {
        Beatmap {
            id,
            beatmapset_id: set,
            mode: Mode::Osu,
            difficulty_name: "Insane".into(),
            difficulty_rating: 5.2,
            bpm: Some(180.0),
            approach_rate: 9.0,
            circle_size: 4.0,
            overall_difficulty: 8.0,
            drain: 5.0,
            status: BeatmapStatus::Ranked,
            beatmapset: Some(Arc::new(beatmapset(set))),
        }
    }

    pub fn country(code: &str) -> Country {
        Country {
            code: code.into(),
            name: format!("Country {code}"),
        }
    }

    pub fn user(id: i64, code: &str) -> User {
        User {
            id,
            username: format!("player{id}"),
            country_code: code.into(),
            ruleset_statistics: BTreeMap::new(),
            country: Some(Arc::new(country(code))),
        }
    }

    pub fn score(id: i64, beatmap_id: i64, user_id: i64, total: i64) -> Score {
        Score {
            id,
            legacy_score_id: None,
            ended_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            mode: Mode::Osu,
            beatmap_id,
            user_id,
            grade: Grade::A,
            mods: Vec::new(),
            mod_acronyms: Vec::new(),
            accuracy: 0.95,
            max_combo: 500,
            statistics: HitStatistics::new(),
            maximum_statistics: HitStatistics::new(),
            total_score: total,
            classic_total_score: total,
            legacy_total_score: 0,
            pp: Some(100.0),
            map_rank: None,
            beatmap: None,
            user: None,
        }
    }

    pub fn with_mods(mut score: Score, acronyms: &[&str]) -> Score {
        score.mods = acronyms
            .iter()
            .map(|a| ScoreMod {
                acronym: a.to_string(),
                settings: Map::new(),
            })
            .collect();
        score.mod_acronyms = acronyms.iter().map(|a| a.to_string()).collect();
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_accepts_ruleset_id_or_name() {
        let from_id: Mode = serde_json::from_str("2").unwrap();
        let from_name: Mode = serde_json::from_str("\"mania\"").unwrap();
        assert_eq!(from_id, Mode::Fruits);
        assert_eq!(from_name, Mode::Mania);
        assert_eq!(serde_json::to_string(&Mode::Taiko).unwrap(), "\"taiko\"");
        assert!(serde_json::from_str::<Mode>("9").is_err());
    }

    #[test]
    fn grade_uses_upstream_spelling() {
        let g: Grade = serde_json::from_str("\"XH\"").unwrap();
        assert_eq!(g, Grade::Xh);
        assert_eq!(serde_json::to_string(&Grade::Sh).unwrap(), "\"SH\"");
        assert_eq!("sh".parse::<Grade>().unwrap(), Grade::Sh);
    }

    #[test]
    fn status_accepts_numeric_form() {
        let s: BeatmapStatus = serde_json::from_str("-2").unwrap();
        assert_eq!(s, BeatmapStatus::Graveyard);
        let s: BeatmapStatus = serde_json::from_str("\"loved\"").unwrap();
        assert_eq!(s, BeatmapStatus::Loved);
    }

    #[test]
    fn mode_keys_serialise_by_name() {
        let mut stats = BTreeMap::new();
        stats.insert(Mode::Osu, RulesetStats { global_rank: Some(10), pp: 9000.0 });
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["osu"]["global_rank"], 10);
    }
}
