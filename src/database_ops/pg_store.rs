//! Postgres [`StoreBackend`] over the five-table schema in `migrations/`.
use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder, Transaction};
use tracing::{debug, instrument};

use super::db::Db;
use super::filter::{Filter, ScoreSelect};
use super::models::{
    Beatmap, Beatmapset, Country, Mode, RulesetStats, Score, ScoreMod, User,
};
use super::store::{Row, RowKey, StoreBackend, Table, WriteBatch, WriteOutcome};
use crate::normalization::HitStatistics;

/// Rows per multi-VALUES insert; keeps scores (17 binds each) well under the bind limit.
const MAX_CHUNK_ROWS: usize = 500;

const SCORE_COLUMNS: &str = "id, legacy_score_id, ended_at, mode, beatmap_id, user_id, grade, mods, \
     mod_acronyms, accuracy, max_combo, statistics, maximum_statistics, total_score, \
     classic_total_score, legacy_total_score, pp";
const BEATMAP_COLUMNS: &str = "id, beatmapset_id, mode, difficulty_name, difficulty_rating, bpm, \
     approach_rate, circle_size, overall_difficulty, drain, status";
const USER_COLUMNS: &str = "id, username, country_code, ruleset_statistics";
const BEATMAPSET_COLUMNS: &str = "id, artist, title, preview_url";
const COUNTRY_COLUMNS: &str = "code, name";

fn columns(table: Table) -> &'static str {
    match table {
        Table::Countries => COUNTRY_COLUMNS,
        Table::Beatmapsets => BEATMAPSET_COLUMNS,
        Table::Users => USER_COLUMNS,
        Table::Beatmaps => BEATMAP_COLUMNS,
        Table::Scores => SCORE_COLUMNS,
    }
}

#[derive(FromRow)]
struct CountryRecord {
    code: String,
    name: String,
}

#[derive(FromRow)]
struct BeatmapsetRecord {
    id: i64,
    artist: String,
    title: String,
    preview_url: Option<String>,
}

#[derive(FromRow)]
struct UserRecord {
    id: i64,
    username: String,
    country_code: String,
    ruleset_statistics: Json<BTreeMap<Mode, RulesetStats>>,
}

#[derive(FromRow)]
struct BeatmapRecord {
    id: i64,
    beatmapset_id: i64,
    mode: String,
    difficulty_name: String,
    difficulty_rating: f32,
    bpm: Option<f32>,
    approach_rate: f32,
    circle_size: f32,
    overall_difficulty: f32,
    drain: f32,
    status: String,
}

#[derive(FromRow)]
struct ScoreRecord {
    id: i64,
    legacy_score_id: Option<i64>,
    ended_at: DateTime<Utc>,
    mode: String,
    beatmap_id: i64,
    user_id: i64,
    grade: String,
    mods: Json<Vec<ScoreMod>>,
    mod_acronyms: Vec<String>,
    accuracy: f32,
    max_combo: i32,
    statistics: Json<HitStatistics>,
    maximum_statistics: Json<HitStatistics>,
    total_score: i64,
    classic_total_score: i64,
    legacy_total_score: i64,
    pp: Option<f32>,
}

impl TryFrom<BeatmapRecord> for Beatmap {
    type Error = anyhow::Error;

    fn try_from(r: BeatmapRecord) -> Result<Self> {
        Ok(Beatmap {
            id: r.id,
            beatmapset_id: r.beatmapset_id,
            mode: r.mode.parse().map_err(|e: String| anyhow!(e))?,
            difficulty_name: r.difficulty_name,
            difficulty_rating: r.difficulty_rating,
            bpm: r.bpm,
            approach_rate: r.approach_rate,
            circle_size: r.circle_size,
            overall_difficulty: r.overall_difficulty,
            drain: r.drain,
            status: r.status.parse().map_err(|e: String| anyhow!(e))?,
            beatmapset: None,
        })
    }
}

impl TryFrom<ScoreRecord> for Score {
    type Error = anyhow::Error;

    fn try_from(r: ScoreRecord) -> Result<Self> {
        Ok(Score {
            id: r.id,
            legacy_score_id: r.legacy_score_id,
            ended_at: r.ended_at,
            mode: r.mode.parse().map_err(|e: String| anyhow!(e))?,
            beatmap_id: r.beatmap_id,
            user_id: r.user_id,
            grade: r.grade.parse().map_err(|e: String| anyhow!(e))?,
            mods: r.mods.0,
            mod_acronyms: r.mod_acronyms,
            accuracy: r.accuracy,
            max_combo: r.max_combo,
            statistics: r.statistics.0,
            maximum_statistics: r.maximum_statistics.0,
            total_score: r.total_score,
            classic_total_score: r.classic_total_score,
            legacy_total_score: r.legacy_total_score,
            pp: r.pp,
            map_rank: None,
            beatmap: None,
            user: None,
        })
    }
}

fn split_keys(keys: &[RowKey]) -> (Vec<i64>, Vec<String>) {
    let mut ids = Vec::new();
    let mut codes = Vec::new();
    for key in keys {
        match key {
            RowKey::Id(id) => ids.push(*id),
            RowKey::Code(code) => codes.push(code.clone()),
        }
    }
    (ids, codes)
}

/// `INSERT ... VALUES ... ON CONFLICT DO NOTHING RETURNING key` for one table's rows.
fn insert_statement(table: Table, rows: &[&Row]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} ({}) ", table.name(), columns(table)));
    qb.push_values(rows, |mut b, row| match row {
        Row::Country(c) => {
            b.push_bind(c.code.clone()).push_bind(c.name.clone());
        }
        Row::Beatmapset(s) => {
            b.push_bind(s.id)
                .push_bind(s.artist.clone())
                .push_bind(s.title.clone())
                .push_bind(s.preview_url.clone());
        }
        Row::User(u) => {
            b.push_bind(u.id)
                .push_bind(u.username.clone())
                .push_bind(u.country_code.clone())
                .push_bind(Json(u.ruleset_statistics.clone()));
        }
        Row::Beatmap(m) => {
            b.push_bind(m.id)
                .push_bind(m.beatmapset_id)
                .push_bind(m.mode.as_str())
                .push_bind(m.difficulty_name.clone())
                .push_bind(m.difficulty_rating)
                .push_bind(m.bpm)
                .push_bind(m.approach_rate)
                .push_bind(m.circle_size)
                .push_bind(m.overall_difficulty)
                .push_bind(m.drain)
                .push_bind(m.status.as_str());
        }
        Row::Score(s) => {
            b.push_bind(s.id)
                .push_bind(s.legacy_score_id)
                .push_bind(s.ended_at)
                .push_bind(s.mode.as_str())
                .push_bind(s.beatmap_id)
                .push_bind(s.user_id)
                .push_bind(s.grade.as_str())
                .push_bind(Json(s.mods.clone()))
                .push_bind(s.mod_acronyms.clone())
                .push_bind(s.accuracy)
                .push_bind(s.max_combo)
                .push_bind(Json(s.statistics.clone()))
                .push_bind(Json(s.maximum_statistics.clone()))
                .push_bind(s.total_score)
                .push_bind(s.classic_total_score)
                .push_bind(s.legacy_total_score)
                .push_bind(s.pp);
        }
    });
    let key = table.key_column();
    qb.push(format!(" ON CONFLICT ({key}) DO NOTHING RETURNING {key}"));
    qb
}

async fn update_row(tx: &mut Transaction<'_, Postgres>, row: &Row) -> Result<bool> {
    let result = match row {
        Row::Country(c) => {
            sqlx::query("UPDATE countries SET name = $2 WHERE code = $1")
                .persistent(false)
                .bind(&c.code)
                .bind(&c.name)
                .execute(&mut **tx)
                .await?
        }
        Row::Beatmapset(s) => {
            sqlx::query("UPDATE beatmapsets SET artist = $2, title = $3, preview_url = $4 WHERE id = $1")
                .persistent(false)
                .bind(s.id)
                .bind(&s.artist)
                .bind(&s.title)
                .bind(&s.preview_url)
                .execute(&mut **tx)
                .await?
        }
        Row::User(u) => {
            sqlx::query(
                "UPDATE users SET username = $2, country_code = $3, ruleset_statistics = $4 WHERE id = $1",
            )
            .persistent(false)
            .bind(u.id)
            .bind(&u.username)
            .bind(&u.country_code)
            .bind(Json(&u.ruleset_statistics))
            .execute(&mut **tx)
            .await?
        }
        Row::Beatmap(m) => {
            sqlx::query(
                "UPDATE beatmaps SET beatmapset_id = $2, mode = $3, difficulty_name = $4, \
                 difficulty_rating = $5, bpm = $6, approach_rate = $7, circle_size = $8, \
                 overall_difficulty = $9, drain = $10, status = $11 WHERE id = $1",
            )
            .persistent(false)
            .bind(m.id)
            .bind(m.beatmapset_id)
            .bind(m.mode.as_str())
            .bind(&m.difficulty_name)
            .bind(m.difficulty_rating)
            .bind(m.bpm)
            .bind(m.approach_rate)
            .bind(m.circle_size)
            .bind(m.overall_difficulty)
            .bind(m.drain)
            .bind(m.status.as_str())
            .execute(&mut **tx)
            .await?
        }
        Row::Score(s) => {
            sqlx::query(
                "UPDATE scores SET legacy_score_id = $2, ended_at = $3, mode = $4, beatmap_id = $5, \
                 user_id = $6, grade = $7, mods = $8, mod_acronyms = $9, accuracy = $10, \
                 max_combo = $11, statistics = $12, maximum_statistics = $13, total_score = $14, \
                 classic_total_score = $15, legacy_total_score = $16, pp = $17 WHERE id = $1",
            )
            .persistent(false)
            .bind(s.id)
            .bind(s.legacy_score_id)
            .bind(s.ended_at)
            .bind(s.mode.as_str())
            .bind(s.beatmap_id)
            .bind(s.user_id)
            .bind(s.grade.as_str())
            .bind(Json(&s.mods))
            .bind(&s.mod_acronyms)
            .bind(s.accuracy)
            .bind(s.max_combo)
            .bind(Json(&s.statistics))
            .bind(Json(&s.maximum_statistics))
            .bind(s.total_score)
            .bind(s.classic_total_score)
            .bind(s.legacy_total_score)
            .bind(s.pp)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StoreBackend for PgStore {
    async fn existing_keys(&self, table: Table, keys: &[RowKey]) -> Result<HashSet<RowKey>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let (ids, codes) = split_keys(keys);
        let sql = format!(
            "SELECT {key} FROM {} WHERE {key} = ANY($1)",
            table.name(),
            key = table.key_column()
        );
        let found = if table == Table::Countries {
            sqlx::query_scalar::<_, String>(&sql)
                .persistent(false)
                .bind(codes)
                .fetch_all(&self.db.pool)
                .await?
                .into_iter()
                .map(RowKey::Code)
                .collect()
        } else {
            sqlx::query_scalar::<_, i64>(&sql)
                .persistent(false)
                .bind(ids)
                .fetch_all(&self.db.pool)
                .await?
                .into_iter()
                .map(RowKey::Id)
                .collect()
        };
        Ok(found)
    }

    async fn fetch_rows(&self, table: Table, keys: &[RowKey]) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (ids, codes) = split_keys(keys);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ANY($1)",
            columns(table),
            table.name(),
            table.key_column()
        );
        let pool = &self.db.pool;
        let rows = match table {
            Table::Countries => sqlx::query_as::<_, CountryRecord>(&sql)
                .persistent(false)
                .bind(codes)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|r| Row::Country(Country { code: r.code, name: r.name }))
                .collect(),
            Table::Beatmapsets => sqlx::query_as::<_, BeatmapsetRecord>(&sql)
                .persistent(false)
                .bind(ids)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|r| {
                    Row::Beatmapset(Beatmapset {
                        id: r.id,
                        artist: r.artist,
                        title: r.title,
                        preview_url: r.preview_url,
                    })
                })
                .collect(),
            Table::Users => sqlx::query_as::<_, UserRecord>(&sql)
                .persistent(false)
                .bind(ids)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|r| {
                    Row::User(User {
                        id: r.id,
                        username: r.username,
                        country_code: r.country_code,
                        ruleset_statistics: r.ruleset_statistics.0,
                        country: None,
                    })
                })
                .collect(),
            Table::Beatmaps => sqlx::query_as::<_, BeatmapRecord>(&sql)
                .persistent(false)
                .bind(ids)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|r| Beatmap::try_from(r).map(Row::Beatmap))
                .collect::<Result<_>>()?,
            Table::Scores => sqlx::query_as::<_, ScoreRecord>(&sql)
                .persistent(false)
                .bind(ids)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|r| Score::try_from(r).map(Row::Score))
                .collect::<Result<_>>()?,
        };
        Ok(rows)
    }

    #[instrument(skip(self, batch), fields(
        inserts = batch.inserts.len(),
        updates = batch.updates.len(),
        deletes = batch.deletes.len()
    ))]
    async fn apply(&self, batch: WriteBatch) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }
        let mut tx = self.db.pool.begin().await.context("beginning write transaction")?;

        let mut inserts: BTreeMap<Table, Vec<&Row>> = BTreeMap::new();
        for row in batch.inserts_in_table_order() {
            inserts.entry(row.table()).or_default().push(row);
        }
        for (table, rows) in inserts {
            for chunk in rows.chunks(MAX_CHUNK_ROWS) {
                let mut qb = insert_statement(table, chunk);
                let returned = qb
                    .build()
                    .persistent(false)
                    .fetch_all(&mut *tx)
                    .await
                    .with_context(|| format!("inserting into {}", table.name()))?;
                WriteOutcome::bump(&mut outcome.inserted, table, returned.len());
            }
        }

        for row in &batch.updates {
            if update_row(&mut tx, row)
                .await
                .with_context(|| format!("updating {} {}", row.table().name(), row.key()))?
            {
                WriteOutcome::bump(&mut outcome.updated, row.table(), 1);
            }
        }

        let mut deletes: BTreeMap<Table, Vec<RowKey>> = BTreeMap::new();
        for (table, key) in batch.deletes_children_first() {
            deletes.entry(*table).or_default().push(key.clone());
        }
        for (table, keys) in deletes.into_iter().rev() {
            let (ids, codes) = split_keys(&keys);
            let sql = format!(
                "DELETE FROM {} WHERE {} = ANY($1)",
                table.name(),
                table.key_column()
            );
            let query = sqlx::query(&sql).persistent(false);
            let query = if table == Table::Countries {
                query.bind(codes)
            } else {
                query.bind(ids)
            };
            let result = query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("deleting from {}", table.name()))?;
            WriteOutcome::bump(&mut outcome.deleted, table, result.rows_affected() as usize);
        }

        tx.commit().await.context("committing write transaction")?;
        debug!(?outcome, "write batch committed");
        Ok(outcome)
    }

    async fn latest_score_time(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(ended_at) FROM scores")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(latest)
    }

    async fn user_ids_in_country(&self, country_code: &str) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE country_code = $1")
            .persistent(false)
            .bind(country_code)
            .fetch_all(&self.db.pool)
            .await?;
        Ok(ids)
    }

    async fn select_scores(&self, select: &ScoreSelect) -> Result<Vec<Score>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {SCORE_COLUMNS} FROM scores WHERE "));
        select.filter.push_sql(&mut qb);
        let dir = if select.descending { "DESC" } else { "ASC" };
        qb.push(format!(
            " ORDER BY {} {dir} NULLS LAST, id {dir}",
            select.sort.column()
        ));
        if let Some(limit) = select.limit {
            qb.push(" LIMIT ").push_bind(limit.max(0));
        }
        if select.offset > 0 {
            qb.push(" OFFSET ").push_bind(select.offset);
        }
        qb.build_query_as::<ScoreRecord>()
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?
            .into_iter()
            .map(Score::try_from)
            .collect()
    }

    async fn count_scores(&self, filter: &Filter) -> Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM scores WHERE ");
        filter.push_sql(&mut qb);
        let count = qb
            .build_query_scalar::<i64>()
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }

    async fn beatmap_leaderboard(&self, beatmap_id: i64, mode: Mode) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT id, total_score FROM scores WHERE beatmap_id = $1 AND mode = $2 \
             ORDER BY total_score DESC, id ASC",
        )
        .persistent(false)
        .bind(beatmap_id)
        .bind(mode.as_str())
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::models::fixtures::{country, score};

    #[test]
    fn insert_statement_skips_conflicts_and_returns_keys() {
        let row = Row::Country(country("PL"));
        let qb = insert_statement(Table::Countries, &[&row]);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO countries (code, name) VALUES ($1, $2)"));
        assert!(sql.ends_with("ON CONFLICT (code) DO NOTHING RETURNING code"));
    }

    #[test]
    fn score_insert_binds_every_column() {
        let a = Row::Score(score(1, 1, 1, 10));
        let b = Row::Score(score(2, 1, 1, 10));
        let qb = insert_statement(Table::Scores, &[&a, &b]);
        let columns = SCORE_COLUMNS.split(',').count();
        assert!(qb.sql().contains(&format!("${}", columns * 2)));
        assert!(!qb.sql().contains(&format!("${}", columns * 2 + 1)));
    }

    #[test]
    fn stored_enum_text_round_trips() {
        let record = BeatmapRecord {
            id: 1,
            beatmapset_id: 2,
            mode: "fruits".into(),
            difficulty_name: "Platter".into(),
            difficulty_rating: 2.5,
            bpm: None,
            approach_rate: 7.0,
            circle_size: 4.0,
            overall_difficulty: 6.0,
            drain: 4.0,
            status: "loved".into(),
        };
        let beatmap = Beatmap::try_from(record).unwrap();
        assert_eq!(beatmap.mode, Mode::Fruits);
        assert_eq!(beatmap.status.as_str(), "loved");
    }

    #[tokio::test]
    #[ignore = "needs a Postgres instance at DATABASE_URL"]
    async fn postgres_create_many_is_insert_if_absent() {
        use crate::database_ops::models::fixtures::{beatmap, user};
        use crate::database_ops::query::UserScoreQuery;
        use crate::database_ops::{EntityUpsertStore, QueryEngine};
        use std::sync::Arc;

        if std::env::var("DATABASE_URL").is_err() {
            return;
        }
        let db = Db::from_env().await.unwrap();
        db.run_migrations().await.unwrap();
        let store = EntityUpsertStore::new(Arc::new(PgStore::new(db)));

        // Ids far above anything osu! hands out, unique per run.
        let base = Utc::now().timestamp_micros();
        let ids: Vec<i64> = (base..base + 3).collect();
        let batch = || {
            ids.iter()
                .map(|&id| {
                    let mut s = score(id, base, base, 1_000);
                    s.beatmap = Some(Arc::new(beatmap(base, base)));
                    s.user = Some(Arc::new(user(base, "PL")));
                    s
                })
                .collect::<Vec<_>>()
        };

        let first = store.create_many(&mut batch()).await.unwrap();
        assert_eq!(first.inserted, 3);
        let second = store.create_many(&mut batch()).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_present, 3);
        assert_eq!(second.parents_inserted, 0);

        let engine = QueryEngine::new(store.clone());
        assert_eq!(engine.user_scores(base, &UserScoreQuery::default()).await.unwrap().len(), 3);
        assert_eq!(engine.user_score_count(base, None).await.unwrap(), 3);

        assert_eq!(store.delete_many::<Score>(&ids).await.unwrap(), 3);
        store.delete_many::<Beatmap>(&[base]).await.unwrap();
        store.delete_many::<Beatmapset>(&[base]).await.unwrap();
        store.delete_many::<User>(&[base]).await.unwrap();
    }
}
