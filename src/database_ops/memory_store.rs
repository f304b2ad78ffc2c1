//! In-process [`StoreBackend`] with the same constraints as the Postgres schema.
//!
//! Each batch is applied to a copy of the tables and swapped in only if every
//! row succeeded, so a failing batch leaves no trace.
use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::filter::{Filter, ScoreSelect, ScoreSort};
use super::models::{Beatmap, Beatmapset, Country, Mode, Score, User};
use super::store::{Row, RowKey, StoreBackend, Table, WriteBatch, WriteOutcome};

#[derive(Debug, Clone, Default)]
struct Tables {
    countries: BTreeMap<String, Country>,
    beatmapsets: BTreeMap<i64, Beatmapset>,
    users: BTreeMap<i64, User>,
    beatmaps: BTreeMap<i64, Beatmap>,
    scores: BTreeMap<i64, Score>,
}

impl Tables {
    fn contains(&self, table: Table, key: &RowKey) -> bool {
        match (table, key) {
            (Table::Countries, RowKey::Code(code)) => self.countries.contains_key(code),
            (Table::Beatmapsets, RowKey::Id(id)) => self.beatmapsets.contains_key(id),
            (Table::Users, RowKey::Id(id)) => self.users.contains_key(id),
            (Table::Beatmaps, RowKey::Id(id)) => self.beatmaps.contains_key(id),
            (Table::Scores, RowKey::Id(id)) => self.scores.contains_key(id),
            _ => false,
        }
    }

    fn get(&self, table: Table, key: &RowKey) -> Option<Row> {
        match (table, key) {
            (Table::Countries, RowKey::Code(code)) => self.countries.get(code).cloned().map(Row::Country),
            (Table::Beatmapsets, RowKey::Id(id)) => self.beatmapsets.get(id).cloned().map(Row::Beatmapset),
            (Table::Users, RowKey::Id(id)) => self.users.get(id).cloned().map(Row::User),
            (Table::Beatmaps, RowKey::Id(id)) => self.beatmaps.get(id).cloned().map(Row::Beatmap),
            (Table::Scores, RowKey::Id(id)) => self.scores.get(id).cloned().map(Row::Score),
            _ => None,
        }
    }

    fn check_parents(&self, row: &Row) -> Result<()> {
        match row {
            Row::User(u) if !self.countries.contains_key(&u.country_code) => {
                bail!("foreign key violation: users.country_code {} not in countries", u.country_code)
            }
            Row::Beatmap(b) if !self.beatmapsets.contains_key(&b.beatmapset_id) => {
                bail!("foreign key violation: beatmaps.beatmapset_id {} not in beatmapsets", b.beatmapset_id)
            }
            Row::Score(s) if !self.beatmaps.contains_key(&s.beatmap_id) => {
                bail!("foreign key violation: scores.beatmap_id {} not in beatmaps", s.beatmap_id)
            }
            Row::Score(s) if !self.users.contains_key(&s.user_id) => {
                bail!("foreign key violation: scores.user_id {} not in users", s.user_id)
            }
            _ => Ok(()),
        }
    }

    fn is_referenced(&self, table: Table, key: &RowKey) -> bool {
        match (table, key) {
            (Table::Countries, RowKey::Code(code)) => self.users.values().any(|u| &u.country_code == code),
            (Table::Beatmapsets, RowKey::Id(id)) => self.beatmaps.values().any(|b| b.beatmapset_id == *id),
            (Table::Users, RowKey::Id(id)) => self.scores.values().any(|s| s.user_id == *id),
            (Table::Beatmaps, RowKey::Id(id)) => self.scores.values().any(|s| s.beatmap_id == *id),
            _ => false,
        }
    }

    /// `true` if written, `false` if the key was already present.
    fn insert(&mut self, row: Row) -> Result<bool> {
        if self.contains(row.table(), &row.key()) {
            return Ok(false);
        }
        self.check_parents(&row)?;
        self.put(row);
        Ok(true)
    }

    /// `true` if an existing row was overwritten.
    fn update(&mut self, row: Row) -> Result<bool> {
        if !self.contains(row.table(), &row.key()) {
            return Ok(false);
        }
        self.check_parents(&row)?;
        self.put(row);
        Ok(true)
    }

    fn put(&mut self, row: Row) {
        match row {
            Row::Country(c) => {
                self.countries.insert(c.code.clone(), c);
            }
            Row::Beatmapset(s) => {
                self.beatmapsets.insert(s.id, s);
            }
            Row::User(u) => {
                self.users.insert(u.id, u);
            }
            Row::Beatmap(b) => {
                self.beatmaps.insert(b.id, b);
            }
            Row::Score(s) => {
                self.scores.insert(s.id, s);
            }
        }
    }

    fn delete(&mut self, table: Table, key: &RowKey) -> Result<bool> {
        if !self.contains(table, key) {
            return Ok(false);
        }
        if self.is_referenced(table, key) {
            return Err(anyhow!(
                "foreign key violation: {} {key} is still referenced",
                table.name()
            ));
        }
        match (table, key) {
            (Table::Countries, RowKey::Code(code)) => self.countries.remove(code).is_some(),
            (Table::Beatmapsets, RowKey::Id(id)) => self.beatmapsets.remove(id).is_some(),
            (Table::Users, RowKey::Id(id)) => self.users.remove(id).is_some(),
            (Table::Beatmaps, RowKey::Id(id)) => self.beatmaps.remove(id).is_some(),
            (Table::Scores, RowKey::Id(id)) => self.scores.remove(id).is_some(),
            _ => false,
        };
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn existing_keys(&self, table: Table, keys: &[RowKey]) -> Result<HashSet<RowKey>> {
        let tables = self.tables.read().await;
        Ok(keys
            .iter()
            .filter(|k| tables.contains(table, k))
            .cloned()
            .collect())
    }

    async fn fetch_rows(&self, table: Table, keys: &[RowKey]) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        let mut seen = HashSet::new();
        Ok(keys
            .iter()
            .filter(|k| seen.insert(*k))
            .filter_map(|k| tables.get(table, k))
            .collect())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<WriteOutcome> {
        let mut guard = self.tables.write().await;
        let mut next = guard.clone();
        let mut outcome = WriteOutcome::default();

        for row in batch.inserts_in_table_order() {
            let table = row.table();
            if next.insert(row.clone())? {
                WriteOutcome::bump(&mut outcome.inserted, table, 1);
            }
        }
        for row in &batch.updates {
            let table = row.table();
            if next.update(row.clone())? {
                WriteOutcome::bump(&mut outcome.updated, table, 1);
            }
        }
        for (table, key) in batch.deletes_children_first() {
            if next.delete(*table, key)? {
                WriteOutcome::bump(&mut outcome.deleted, *table, 1);
            }
        }

        *guard = next;
        Ok(outcome)
    }

    async fn latest_score_time(&self) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables.scores.values().map(|s| s.ended_at).max())
    }

    async fn user_ids_in_country(&self, country_code: &str) -> Result<Vec<i64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .filter(|u| u.country_code == country_code)
            .map(|u| u.id)
            .collect())
    }

    async fn select_scores(&self, select: &ScoreSelect) -> Result<Vec<Score>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&Score> = tables
            .scores
            .values()
            .filter(|s| select.filter.matches(s))
            .collect();
        rows.sort_by(|a, b| select.sort.compare(a, b, select.descending));
        let offset = usize::try_from(select.offset.max(0)).unwrap_or(usize::MAX);
        let limit = select
            .limit
            .map(|l| usize::try_from(l.max(0)).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count_scores(&self, filter: &Filter) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables.scores.values().filter(|s| filter.matches(s)).count() as i64)
    }

    async fn beatmap_leaderboard(&self, beatmap_id: i64, mode: Mode) -> Result<Vec<(i64, i64)>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&Score> = tables
            .scores
            .values()
            .filter(|s| s.beatmap_id == beatmap_id && s.mode == mode)
            .collect();
        rows.sort_by(|a, b| b.total_score.cmp(&a.total_score).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().map(|s| (s.id, s.total_score)).collect())
    }
}
