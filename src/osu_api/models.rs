//! Wire shapes returned by the osu! API v2, and their conversion into the
//! persisted domain models.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::database_ops::models::{
    Beatmap, BeatmapStatus, Beatmapset, Country, Grade, Mode, RulesetStats, Score, ScoreMod, User,
};
use crate::normalization::hit_result_table;

/// One page of a cursor-paginated listing. `cursor` is `None` once exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

/// A beatmapset from search, with its difficulties already linked to it.
#[derive(Debug, Clone)]
pub struct BeatmapsetListing {
    pub beatmapset: Arc<Beatmapset>,
    pub beatmaps: Vec<Beatmap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBeatmapset {
    pub id: i64,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub beatmaps: Vec<ApiBeatmap>,
}

impl ApiBeatmapset {
    fn split(self) -> (Beatmapset, Vec<ApiBeatmap>) {
        (
            Beatmapset {
                id: self.id,
                artist: self.artist,
                title: self.title,
                preview_url: self.preview_url,
            },
            self.beatmaps,
        )
    }

    pub fn into_listing(self) -> BeatmapsetListing {
        let (set, beatmaps) = self.split();
        let set = Arc::new(set);
        let beatmaps = beatmaps
            .into_iter()
            .map(|b| {
                let mut beatmap = b.into_beatmap();
                beatmap.beatmapset_id = set.id;
                beatmap.beatmapset = Some(set.clone());
                beatmap
            })
            .collect();
        BeatmapsetListing {
            beatmapset: set,
            beatmaps,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBeatmap {
    pub id: i64,
    pub beatmapset_id: i64,
    #[serde(default)]
    pub beatmapset: Option<Box<ApiBeatmapset>>,
    pub mode: Mode,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub difficulty_rating: f32,
    #[serde(default)]
    pub bpm: Option<f32>,
    #[serde(default)]
    pub ar: f32,
    #[serde(default)]
    pub cs: f32,
    /// Overall difficulty; upstream names it `accuracy`.
    #[serde(default)]
    pub accuracy: f32,
    #[serde(default)]
    pub drain: f32,
    pub status: BeatmapStatus,
}

impl ApiBeatmap {
    pub fn into_beatmap(self) -> Beatmap {
        let beatmapset = self.beatmapset.map(|set| Arc::new(set.split().0));
        Beatmap {
            id: self.id,
            beatmapset_id: self.beatmapset_id,
            mode: self.mode,
            difficulty_name: self.version,
            difficulty_rating: self.difficulty_rating,
            bpm: self.bpm,
            approach_rate: self.ar,
            circle_size: self.cs,
            overall_difficulty: self.accuracy,
            drain: self.drain,
            status: self.status,
            beatmapset,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    pub username: String,
    pub country_code: String,
    #[serde(default)]
    pub country: Option<Country>,
    #[serde(default)]
    pub statistics_rulesets: Option<BTreeMap<String, Option<RulesetStats>>>,
}

impl ApiUser {
    pub fn into_user(self) -> User {
        let ruleset_statistics = self
            .statistics_rulesets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(mode, stats)| Some((mode.parse::<Mode>().ok()?, stats?)))
            .collect();
        let country_code = self.country_code;
        let country = self.country.map(|c| {
            Arc::new(Country {
                code: country_code.clone(),
                name: c.name,
            })
        });
        User {
            id: self.id,
            username: self.username,
            country_code,
            ruleset_statistics,
            country,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiScore {
    pub id: i64,
    #[serde(default)]
    pub legacy_score_id: Option<i64>,
    pub ended_at: DateTime<Utc>,
    pub ruleset_id: Mode,
    #[serde(default)]
    pub beatmap_id: i64,
    pub user_id: i64,
    pub rank: Grade,
    #[serde(default)]
    pub mods: Vec<ScoreMod>,
    pub accuracy: f32,
    #[serde(default)]
    pub max_combo: i32,
    #[serde(default)]
    pub statistics: Value,
    #[serde(default)]
    pub maximum_statistics: Value,
    pub total_score: i64,
    #[serde(default)]
    pub classic_total_score: i64,
    #[serde(default)]
    pub legacy_total_score: i64,
    #[serde(default)]
    pub pp: Option<f32>,
}

impl ApiScore {
    /// Acronyms are left empty; the ingestion pipeline derives them.
    pub fn into_score(self) -> Score {
        let table = hit_result_table();
        Score {
            id: self.id,
            legacy_score_id: self.legacy_score_id.filter(|id| *id > 0),
            ended_at: self.ended_at,
            mode: self.ruleset_id,
            beatmap_id: self.beatmap_id,
            user_id: self.user_id,
            grade: self.rank,
            mods: self.mods,
            mod_acronyms: Vec::new(),
            accuracy: self.accuracy,
            max_combo: self.max_combo,
            statistics: table.map(&self.statistics),
            maximum_statistics: table.map(&self.maximum_statistics),
            total_score: self.total_score,
            classic_total_score: self.classic_total_score,
            legacy_total_score: self.legacy_total_score,
            pp: self.pp,
            map_rank: None,
            beatmap: None,
            user: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BeatmapsetSearchResponse {
    #[serde(default)]
    pub beatmapsets: Vec<ApiBeatmapset>,
    #[serde(default)]
    pub cursor_string: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScoresResponse {
    #[serde(default)]
    pub scores: Vec<ApiScore>,
    #[serde(default)]
    pub cursor_string: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BeatmapsResponse {
    pub beatmaps: Vec<ApiBeatmap>,
}

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<ApiUser>,
}

/// Empty cursors are treated as "no further pages".
pub(crate) fn normalize_cursor(cursor: Option<String>) -> Option<String> {
    cursor.filter(|c| !c.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::HitResult;
    use serde_json::json;

    #[test]
    fn score_payload_maps_statistics_and_mode() {
        let raw = json!({
            "id": 4_000_000_001i64,
            "legacy_score_id": 0,
            "ended_at": "2024-06-01T12:00:00Z",
            "ruleset_id": 3,
            "beatmap_id": 75,
            "user_id": 2,
            "rank": "SH",
            "mods": [{"acronym": "DT", "settings": {"speed_change": 1.3}}, {"acronym": "HD"}],
            "accuracy": 0.98,
            "max_combo": 1200,
            "statistics": {"great": 900, "perfect": 300, "miss": 1},
            "maximum_statistics": {"perfect": 1201},
            "total_score": 912345,
            "pp": null
        });
        let score = serde_json::from_value::<ApiScore>(raw).unwrap().into_score();
        assert_eq!(score.mode, Mode::Mania);
        assert_eq!(score.grade, Grade::Sh);
        assert_eq!(score.legacy_score_id, None);
        assert_eq!(score.mods.len(), 2);
        assert!(score.mods[1].settings.is_empty());
        assert_eq!(score.statistics.get(&HitResult::Perfect), Some(&300));
        assert_eq!(score.maximum_statistics.get(&HitResult::Perfect), Some(&1201));
        assert!(score.pp.is_none());
    }

    #[test]
    fn search_listing_links_beatmaps_to_their_set() {
        let raw = json!({
            "id": 1,
            "artist": "xi",
            "title": "FREEDOM DiVE",
            "preview_url": "//b.ppy.sh/preview/1.mp3",
            "beatmaps": [{
                "id": 10, "beatmapset_id": 1, "mode": "osu", "version": "FOUR DIMENSIONS",
                "difficulty_rating": 7.0, "bpm": 222.22, "ar": 10, "cs": 4, "accuracy": 8,
                "drain": 6, "status": "ranked"
            }]
        });
        let listing = serde_json::from_value::<ApiBeatmapset>(raw).unwrap().into_listing();
        assert_eq!(listing.beatmaps.len(), 1);
        let beatmap = &listing.beatmaps[0];
        assert_eq!(beatmap.difficulty_name, "FOUR DIMENSIONS");
        assert_eq!(beatmap.overall_difficulty, 8.0);
        assert!(Arc::ptr_eq(beatmap.beatmapset.as_ref().unwrap(), &listing.beatmapset));
    }

    #[test]
    fn user_payload_keeps_known_rulesets_only() {
        let raw = json!({
            "id": 2,
            "username": "peppy",
            "country_code": "AU",
            "country": {"code": "AU", "name": "Australia"},
            "statistics_rulesets": {
                "osu": {"global_rank": 100, "pp": 4000.5},
                "taiko": null,
                "unknown": {"global_rank": 1, "pp": 1.0}
            }
        });
        let user = serde_json::from_value::<ApiUser>(raw).unwrap().into_user();
        assert_eq!(user.ruleset_statistics.len(), 1);
        assert_eq!(user.ruleset_statistics[&Mode::Osu].global_rank, Some(100));
        assert_eq!(user.country.as_deref().map(|c| c.name.as_str()), Some("Australia"));
    }

    #[test]
    fn blank_cursor_means_exhausted() {
        assert_eq!(normalize_cursor(Some(String::new())), None);
        assert_eq!(normalize_cursor(Some("abc".into())), Some("abc".into()));
    }
}
