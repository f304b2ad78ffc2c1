// API request/response models (DTOs)

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::database_ops::filter::ScoreSort;
use crate::database_ops::models::Mode;
use crate::database_ops::query::{ScoreQuery, UserScoreQuery};

/// Upper bound on ids accepted by the `?ids=` lookups.
pub const MAX_LOOKUP_IDS: usize = 100;

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub latest_score_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreCountResponse {
    pub user_id: i64,
    pub mode: Option<Mode>,
    pub count: i64,
}

fn parse_mode(raw: Option<&str>) -> Result<Option<Mode>, String> {
    raw.map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::parse::<Mode>)
        .transpose()
}

fn parse_sort(raw: Option<&str>) -> Result<ScoreSort, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(ScoreSort::default()),
        Some(s) => ScoreSort::parse(s).ok_or_else(|| format!("unknown sort '{s}'")),
    }
}

/// `HD,DT` or `HD DT` into acronyms.
fn split_mods(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split([',', ' ', '+'])
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// `?ids=1,2,3`
#[derive(Debug, Deserialize)]
pub struct IdsParams {
    pub ids: String,
}

impl IdsParams {
    pub fn parse(&self) -> Result<Vec<i64>, String> {
        let ids = self
            .ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i64>().map_err(|_| format!("invalid id '{s}'")))
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() || ids.len() > MAX_LOOKUP_IDS {
            return Err(format!("expected 1..={MAX_LOOKUP_IDS} ids, got {}", ids.len()));
        }
        Ok(ids)
    }
}

/// Query string of `GET /api/v1/scores`. Accepts snake_case or camelCase keys.
#[derive(Debug, Default, Deserialize)]
pub struct ScoresParams {
    pub mode: Option<String>,
    #[serde(alias = "dateStart")]
    pub date_start: Option<NaiveDate>,
    #[serde(alias = "dateEnd")]
    pub date_end: Option<NaiveDate>,
    pub country: Option<String>,
    #[serde(alias = "mandatoryMods")]
    pub mandatory_mods: Option<String>,
    #[serde(alias = "optionalMods")]
    pub optional_mods: Option<String>,
    pub amount: Option<i64>,
    pub sort: Option<String>,
    #[serde(alias = "isDescending")]
    pub descending: Option<bool>,
}

impl ScoresParams {
    pub fn into_query(self) -> Result<ScoreQuery, String> {
        Ok(ScoreQuery {
            mode: parse_mode(self.mode.as_deref())?,
            date_start: self.date_start,
            date_end: self.date_end,
            country: self.country,
            mandatory_mods: split_mods(self.mandatory_mods.as_deref()),
            optional_mods: split_mods(self.optional_mods.as_deref()),
            amount: self.amount,
            sort: parse_sort(self.sort.as_deref())?,
            descending: self.descending,
        })
    }
}

/// Query string of `GET /api/v1/users/{id}/scores`.
#[derive(Debug, Default, Deserialize)]
pub struct UserScoresParams {
    pub mode: Option<String>,
    #[serde(alias = "mandatoryMods")]
    pub mandatory_mods: Option<String>,
    #[serde(alias = "optionalMods")]
    pub optional_mods: Option<String>,
    pub page: Option<i64>,
    #[serde(alias = "amountPerPage")]
    pub amount_per_page: Option<i64>,
    pub sort: Option<String>,
    #[serde(alias = "isDescending")]
    pub descending: Option<bool>,
}

impl UserScoresParams {
    pub fn into_query(self) -> Result<UserScoreQuery, String> {
        Ok(UserScoreQuery {
            mode: parse_mode(self.mode.as_deref())?,
            mandatory_mods: split_mods(self.mandatory_mods.as_deref()),
            optional_mods: split_mods(self.optional_mods.as_deref()),
            page: self.page,
            amount_per_page: self.amount_per_page,
            sort: parse_sort(self.sort.as_deref())?,
            descending: self.descending,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ModeParams {
    pub mode: Option<String>,
}

impl ModeParams {
    pub fn mode(&self) -> Result<Option<Mode>, String> {
        parse_mode(self.mode.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_params_parse_mods_mode_and_sort() {
        let params = ScoresParams {
            mode: Some("mania".into()),
            mandatory_mods: Some("HD,DT(1.3x)".into()),
            optional_mods: Some("HR+FL".into()),
            sort: Some("totalScore".into()),
            ..ScoresParams::default()
        };
        let q = params.into_query().unwrap();
        assert_eq!(q.mode, Some(Mode::Mania));
        assert_eq!(q.mandatory_mods, vec!["HD", "DT(1.3x)"]);
        assert_eq!(q.optional_mods, vec!["HR", "FL"]);
        assert_eq!(q.sort, ScoreSort::TotalScore);
    }

    #[test]
    fn bad_mode_or_sort_is_rejected() {
        let bad_mode = ScoresParams {
            mode: Some("piano".into()),
            ..ScoresParams::default()
        };
        assert!(bad_mode.into_query().is_err());
        let bad_sort = UserScoresParams {
            sort: Some("vibes".into()),
            ..UserScoresParams::default()
        };
        assert!(bad_sort.into_query().is_err());
    }

    #[test]
    fn ids_are_bounded() {
        assert_eq!(IdsParams { ids: "1, 2,3".into() }.parse().unwrap(), vec![1, 2, 3]);
        assert!(IdsParams { ids: "".into() }.parse().is_err());
        assert!(IdsParams { ids: "1,x".into() }.parse().is_err());
        let many = (0..=MAX_LOOKUP_IDS).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        assert!(IdsParams { ids: many }.parse().is_err());
    }
}
