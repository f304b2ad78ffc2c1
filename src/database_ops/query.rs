//! Read side: filtered, sorted, paginated score queries plus entity lookups.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use itertools::Itertools;
use tracing::{debug, instrument};

use super::filter::{mod_filter, CmpOp, Filter, ScoreField, ScoreSelect, ScoreSort};
use super::models::{Beatmap, Beatmapset, Country, Mode, Score, User};
use super::store::{Entity, EntityUpsertStore, ParentIndex};

pub const DEFAULT_AMOUNT: i64 = 25;
pub const DEFAULT_USER_PAGE_SIZE: i64 = 100;
pub const MAX_AMOUNT: i64 = 100;
pub const RECENT_LIMIT: i64 = 100;

/// Clamp a requested page size into `[0, MAX_AMOUNT]`.
pub fn clamp_amount(amount: Option<i64>, default: i64) -> i64 {
    amount.unwrap_or(default).clamp(0, MAX_AMOUNT)
}

#[derive(Debug, Clone, Default)]
pub struct ScoreQuery {
    pub mode: Option<Mode>,
    /// Inclusive, whole UTC days. Both omitted means the day of the latest stored score.
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub country: Option<String>,
    pub mandatory_mods: Vec<String>,
    pub optional_mods: Vec<String>,
    pub amount: Option<i64>,
    pub sort: ScoreSort,
    /// Defaults to descending.
    pub descending: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UserScoreQuery {
    pub mode: Option<Mode>,
    pub mandatory_mods: Vec<String>,
    pub optional_mods: Vec<String>,
    /// 1-based; anything below 1 is the first page.
    pub page: Option<i64>,
    pub amount_per_page: Option<i64>,
    pub sort: ScoreSort,
    pub descending: Option<bool>,
}

fn clean_mods(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// `[start 00:00, end+1 00:00)` on whichever ends are given.
fn date_filter(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Filter {
    let mut filter = Filter::all();
    if let Some(start) = start {
        filter = filter.and(Filter::cmp(ScoreField::EndedAt, CmpOp::Ge, day_start(start)));
    }
    if let Some(next) = end.and_then(|d| d.succ_opt()) {
        filter = filter.and(Filter::cmp(ScoreField::EndedAt, CmpOp::Lt, day_start(next)));
    }
    filter
}

fn with_mode_and_mods(
    mut filter: Filter,
    mode: Option<Mode>,
    mandatory: &[String],
    optional: &[String],
) -> Filter {
    if let Some(mode) = mode {
        filter = filter.and(Filter::eq(ScoreField::Mode, mode.as_str()));
    }
    if let Some(mods) = mod_filter(&clean_mods(mandatory), &clean_mods(optional)) {
        filter = filter.and(mods);
    }
    filter
}

#[derive(Clone)]
pub struct QueryEngine {
    store: EntityUpsertStore,
}

impl QueryEngine {
    pub fn new(store: EntityUpsertStore) -> Self {
        Self { store }
    }

    /// Scores matching `query`, with `map_rank` set and parents attached.
    #[instrument(skip(self))]
    pub async fn scores(&self, query: &ScoreQuery) -> Result<Vec<Score>> {
        let backend = self.store.backend();
        let (start, end) = match (query.date_start, query.date_end) {
            (None, None) => {
                let latest = backend.latest_score_time().await?.map(|t| t.date_naive());
                (latest, latest)
            }
            given => given,
        };

        let mut filter = with_mode_and_mods(
            date_filter(start, end),
            query.mode,
            &query.mandatory_mods,
            &query.optional_mods,
        );
        if let Some(code) = query.country.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let ids = backend.user_ids_in_country(&code.to_ascii_uppercase()).await?;
            filter = filter.and(Filter::one_of(ScoreField::UserId, ids));
        }

        let select = ScoreSelect {
            filter,
            sort: query.sort,
            descending: query.descending.unwrap_or(true),
            limit: Some(clamp_amount(query.amount, DEFAULT_AMOUNT)),
            offset: 0,
        };
        let mut scores = backend.select_scores(&select).await?;
        self.assign_ranks(&mut scores).await?;
        self.hydrate(&mut scores).await?;
        debug!(returned = scores.len(), "score query served");
        Ok(scores)
    }

    /// One page of a single user's scores.
    #[instrument(skip(self))]
    pub async fn user_scores(&self, user_id: i64, query: &UserScoreQuery) -> Result<Vec<Score>> {
        let amount = clamp_amount(query.amount_per_page, DEFAULT_USER_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);
        let filter = with_mode_and_mods(
            Filter::eq(ScoreField::UserId, user_id),
            query.mode,
            &query.mandatory_mods,
            &query.optional_mods,
        );
        let select = ScoreSelect {
            filter,
            sort: query.sort,
            descending: query.descending.unwrap_or(true),
            limit: Some(amount),
            offset: (page - 1).saturating_mul(amount),
        };
        let mut scores = self.store.backend().select_scores(&select).await?;
        self.assign_ranks(&mut scores).await?;
        self.hydrate(&mut scores).await?;
        Ok(scores)
    }

    pub async fn user_score_count(&self, user_id: i64, mode: Option<Mode>) -> Result<i64> {
        let filter = with_mode_and_mods(Filter::eq(ScoreField::UserId, user_id), mode, &[], &[]);
        self.store.backend().count_scores(&filter).await
    }

    /// Newest stored scores, most recent first.
    pub async fn recent_scores(&self) -> Result<Vec<Score>> {
        let select = ScoreSelect {
            filter: Filter::all(),
            sort: ScoreSort::Date,
            descending: true,
            limit: Some(RECENT_LIMIT),
            offset: 0,
        };
        let mut scores = self.store.backend().select_scores(&select).await?;
        self.hydrate(&mut scores).await?;
        Ok(scores)
    }

    /// `ended_at` of the newest stored score.
    pub async fn latest_score_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.backend().latest_score_time().await
    }

    pub async fn beatmap(&self, id: i64) -> Result<Option<Beatmap>> {
        Ok(self.beatmaps(&[id]).await?.into_iter().next())
    }

    pub async fn beatmaps(&self, ids: &[i64]) -> Result<Vec<Beatmap>> {
        let mut beatmaps: Vec<Beatmap> = self.store.get_many(ids).await?;
        let set_ids: Vec<i64> = distinct(beatmaps.iter().map(|b| b.beatmapset_id));
        let index = ParentIndex {
            beatmapsets: arc_map(self.store.get_many::<Beatmapset>(&set_ids).await?, |s| s.id),
            ..ParentIndex::default()
        };
        for b in &mut beatmaps {
            b.repoint(&index);
        }
        Ok(beatmaps)
    }

    pub async fn beatmapsets(&self, ids: &[i64]) -> Result<Vec<Beatmapset>> {
        self.store.get_many(ids).await
    }

    pub async fn user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.users(&[id]).await?.into_iter().next())
    }

    pub async fn users(&self, ids: &[i64]) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.store.get_many(ids).await?;
        let codes: Vec<String> = distinct(users.iter().map(|u| u.country_code.clone()));
        let index = ParentIndex {
            countries: arc_map(self.store.get_many::<Country>(&codes).await?, |c| c.code.clone()),
            ..ParentIndex::default()
        };
        for u in &mut users {
            u.repoint(&index);
        }
        Ok(users)
    }

    /// Rank each score among every stored score on the same beatmap in the
    /// same mode: total score descending, ties by ascending id, 1-based.
    async fn assign_ranks(&self, scores: &mut [Score]) -> Result<()> {
        let mut boards: HashMap<(i64, Mode), HashMap<i64, u32>> = HashMap::new();
        for key in distinct(scores.iter().map(|s| (s.beatmap_id, s.mode))) {
            let board = self
                .store
                .backend()
                .beatmap_leaderboard(key.0, key.1)
                .await?;
            let positions = board
                .into_iter()
                .zip(1u32..)
                .map(|((id, _), rank)| (id, rank))
                .collect();
            boards.insert(key, positions);
        }
        for s in scores.iter_mut() {
            s.map_rank = boards
                .get(&(s.beatmap_id, s.mode))
                .and_then(|b| b.get(&s.id))
                .copied();
        }
        Ok(())
    }

    /// Attach stored beatmaps (with sets) and users (with countries).
    async fn hydrate(&self, scores: &mut [Score]) -> Result<()> {
        if scores.is_empty() {
            return Ok(());
        }
        let beatmap_ids = distinct(scores.iter().map(|s| s.beatmap_id));
        let user_ids = distinct(scores.iter().map(|s| s.user_id));
        let index = ParentIndex {
            beatmaps: arc_map(self.beatmaps(&beatmap_ids).await?, |b| b.id),
            users: arc_map(self.users(&user_ids).await?, |u| u.id),
            ..ParentIndex::default()
        };
        for s in scores.iter_mut() {
            s.repoint(&index);
        }
        Ok(())
    }
}

fn distinct<T: Ord>(items: impl Iterator<Item = T>) -> Vec<T> {
    items.sorted_unstable().dedup().collect()
}

fn arc_map<K, E>(rows: Vec<E>, key: impl Fn(&E) -> K) -> HashMap<K, Arc<E>>
where
    K: std::hash::Hash + Eq,
{
    rows.into_iter().map(|e| (key(&e), Arc::new(e))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::database_ops::models::fixtures::{beatmap, score, user, with_mods};
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn linked(mut s: Score, country: &str) -> Score {
        s.beatmap = Some(Arc::new(beatmap(s.beatmap_id, 1)));
        s.user = Some(Arc::new(user(s.user_id, country)));
        s
    }

    async fn engine_with(scores: Vec<Score>) -> QueryEngine {
        let store = EntityUpsertStore::new(Arc::new(MemoryStore::new()));
        let mut scores = scores;
        store.create_many(&mut scores).await.unwrap();
        QueryEngine::new(store)
    }

    #[test]
    fn amount_is_clamped() {
        assert_eq!(clamp_amount(Some(500), DEFAULT_AMOUNT), 100);
        assert_eq!(clamp_amount(Some(-5), DEFAULT_AMOUNT), 0);
        assert_eq!(clamp_amount(None, DEFAULT_AMOUNT), 25);
        assert_eq!(clamp_amount(None, DEFAULT_USER_PAGE_SIZE), 100);
    }

    #[tokio::test]
    async fn rank_follows_total_score_then_ascending_id() {
        let engine = engine_with(vec![
            linked(score(5, 75, 1, 1000), "PL"),
            linked(score(3, 75, 2, 1000), "PL"),
            linked(score(7, 75, 3, 900), "PL"),
        ])
        .await;
        let scores = engine
            .scores(&ScoreQuery {
                sort: ScoreSort::TotalScore,
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        let ranks: Vec<(i64, Option<u32>)> = scores.iter().map(|s| (s.id, s.map_rank)).collect();
        assert_eq!(ranks, vec![(3, Some(1)), (5, Some(2)), (7, Some(3))]);
    }

    #[tokio::test]
    async fn rank_counts_scores_outside_the_page() {
        let engine = engine_with(vec![
            linked(score(1, 75, 1, 5000), "PL"),
            linked(score(2, 75, 2, 100), "DE"),
        ])
        .await;
        let scores = engine
            .scores(&ScoreQuery {
                country: Some("de".into()),
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].map_rank, Some(2));
    }

    #[tokio::test]
    async fn missing_dates_default_to_the_latest_day() {
        let mut old = score(1, 75, 1, 100);
        old.ended_at = Utc.with_ymd_and_hms(2024, 5, 30, 23, 59, 0).unwrap();
        let engine = engine_with(vec![linked(old, "PL"), linked(score(2, 75, 1, 200), "PL")]).await;

        let latest_only = engine.scores(&ScoreQuery::default()).await.unwrap();
        assert_eq!(latest_only.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2]);

        let open_ended = engine
            .scores(&ScoreQuery {
                date_start: Some(day(2024, 5, 30)),
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(open_ended.len(), 2);

        let bounded = engine
            .scores(&ScoreQuery {
                date_end: Some(day(2024, 5, 30)),
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(bounded.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn mods_and_mode_narrow_the_result() {
        let mut taiko = score(3, 75, 1, 100);
        taiko.mode = Mode::Taiko;
        let engine = engine_with(vec![
            linked(with_mods(score(1, 75, 1, 100), &["HD", "DT"]), "PL"),
            linked(with_mods(score(2, 75, 1, 100), &["HD", "DT", "HR"]), "PL"),
            linked(taiko, "PL"),
        ])
        .await;
        let exact = engine
            .scores(&ScoreQuery {
                mandatory_mods: vec!["HD".into(), "DT".into()],
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(exact.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);

        let taiko_only = engine
            .scores(&ScoreQuery {
                mode: Some(Mode::Taiko),
                ..ScoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(taiko_only.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn results_carry_stored_parents() {
        let engine = engine_with(vec![linked(score(1, 75, 9, 100), "JP")]).await;
        let scores = engine.scores(&ScoreQuery::default()).await.unwrap();
        let beatmap = scores[0].beatmap.as_ref().unwrap();
        assert_eq!(beatmap.beatmapset.as_ref().map(|s| s.id), Some(1));
        let user = scores[0].user.as_ref().unwrap();
        assert_eq!(user.country.as_ref().map(|c| c.code.as_str()), Some("JP"));
    }

    #[tokio::test]
    async fn user_scores_page_and_count() {
        let scores = (1..=5).map(|i| linked(score(i, 75, 4, i * 100), "PL")).collect();
        let engine = engine_with(scores).await;
        let page = engine
            .user_scores(
                4,
                &UserScoreQuery {
                    page: Some(2),
                    amount_per_page: Some(2),
                    sort: ScoreSort::TotalScore,
                    ..UserScoreQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(engine.user_score_count(4, None).await.unwrap(), 5);
        assert_eq!(engine.user_score_count(4, Some(Mode::Mania)).await.unwrap(), 0);
        assert_eq!(engine.user_score_count(5, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_scores_are_newest_first() {
        let mut newer = score(1, 75, 1, 100);
        newer.ended_at = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let engine = engine_with(vec![linked(score(2, 75, 1, 100), "PL"), linked(newer, "PL")]).await;
        let recent = engine.recent_scores().await.unwrap();
        assert_eq!(recent.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
