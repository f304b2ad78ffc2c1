//! Idempotent create/update/delete for the five persisted entity types.
//!
//! [`EntityUpsertStore`] owns the ordering rules (parents before dependents,
//! one batched existence lookup per table, insert only what is absent) and
//! hands a single [`WriteBatch`] to a [`StoreBackend`], which applies it
//! atomically.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::filter::{Filter, ScoreSelect};
use super::models::{Beatmap, Beatmapset, Country, Mode, Score, User};

/// Tables in foreign-key order: every table only references tables before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Countries,
    Beatmapsets,
    Users,
    Beatmaps,
    Scores,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Countries => "countries",
            Table::Beatmapsets => "beatmapsets",
            Table::Users => "users",
            Table::Beatmaps => "beatmaps",
            Table::Scores => "scores",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Table::Countries => "code",
            _ => "id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Id(i64),
    Code(String),
}

impl RowKey {
    pub fn as_id(&self) -> Option<i64> {
        match self {
            RowKey::Id(id) => Some(*id),
            RowKey::Code(_) => None,
        }
    }

    pub fn as_code(&self) -> Option<&str> {
        match self {
            RowKey::Code(code) => Some(code),
            RowKey::Id(_) => None,
        }
    }
}

impl From<i64> for RowKey {
    fn from(id: i64) -> Self {
        RowKey::Id(id)
    }
}

impl From<String> for RowKey {
    fn from(code: String) -> Self {
        RowKey::Code(code)
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Id(id) => write!(f, "{id}"),
            RowKey::Code(code) => f.write_str(code),
        }
    }
}

/// A stored row. Parent references are always `None` here.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Country(Country),
    Beatmapset(Beatmapset),
    User(User),
    Beatmap(Beatmap),
    Score(Score),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Country(_) => Table::Countries,
            Row::Beatmapset(_) => Table::Beatmapsets,
            Row::User(_) => Table::Users,
            Row::Beatmap(_) => Table::Beatmaps,
            Row::Score(_) => Table::Scores,
        }
    }

    pub fn key(&self) -> RowKey {
        match self {
            Row::Country(c) => RowKey::Code(c.code.clone()),
            Row::Beatmapset(s) => RowKey::Id(s.id),
            Row::User(u) => RowKey::Id(u.id),
            Row::Beatmap(b) => RowKey::Id(b.id),
            Row::Score(s) => RowKey::Id(s.id),
        }
    }
}

/// Everything one store call writes. Applied atomically: inserts in table
/// order, then updates, then deletes in reverse table order.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub inserts: Vec<Row>,
    pub updates: Vec<Row>,
    pub deletes: Vec<(Table, RowKey)>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub(crate) fn inserts_in_table_order(&self) -> Vec<&Row> {
        let mut rows: Vec<&Row> = self.inserts.iter().collect();
        rows.sort_by_key(|r| r.table());
        rows
    }

    pub(crate) fn deletes_children_first(&self) -> Vec<&(Table, RowKey)> {
        let mut rows: Vec<&(Table, RowKey)> = self.deletes.iter().collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows
    }
}

/// Rows actually written per table. Inserts that hit an existing key count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: BTreeMap<Table, usize>,
    pub updated: BTreeMap<Table, usize>,
    pub deleted: BTreeMap<Table, usize>,
}

impl WriteOutcome {
    pub fn inserted(&self, table: Table) -> usize {
        self.inserted.get(&table).copied().unwrap_or(0)
    }

    pub fn updated(&self, table: Table) -> usize {
        self.updated.get(&table).copied().unwrap_or(0)
    }

    pub fn deleted(&self, table: Table) -> usize {
        self.deleted.get(&table).copied().unwrap_or(0)
    }

    pub(crate) fn bump(map: &mut BTreeMap<Table, usize>, table: Table, n: usize) {
        *map.entry(table).or_insert(0) += n;
    }
}

/// Storage seam shared by the Postgres and in-memory backends.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Subset of `keys` present in `table`, in one lookup.
    async fn existing_keys(&self, table: Table, keys: &[RowKey]) -> Result<HashSet<RowKey>>;

    async fn fetch_rows(&self, table: Table, keys: &[RowKey]) -> Result<Vec<Row>>;

    /// Apply `batch` atomically. Inserts on an existing key are skipped; a
    /// dangling foreign key or a delete of a referenced row fails the whole batch.
    async fn apply(&self, batch: WriteBatch) -> Result<WriteOutcome>;

    async fn latest_score_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn user_ids_in_country(&self, country_code: &str) -> Result<Vec<i64>>;

    async fn select_scores(&self, select: &ScoreSelect) -> Result<Vec<Score>>;

    async fn count_scores(&self, filter: &Filter) -> Result<i64>;

    /// `(score id, total_score)` for every stored score on the beatmap in `mode`,
    /// ordered by total score descending then id ascending.
    async fn beatmap_leaderboard(&self, beatmap_id: i64, mode: Mode) -> Result<Vec<(i64, i64)>>;
}

/// Persisted parents, keyed for re-pointing dependents' in-memory references.
#[derive(Debug, Default)]
pub struct ParentIndex {
    pub countries: HashMap<String, Arc<Country>>,
    pub beatmapsets: HashMap<i64, Arc<Beatmapset>>,
    pub users: HashMap<i64, Arc<User>>,
    pub beatmaps: HashMap<i64, Arc<Beatmap>>,
}

impl ParentIndex {
    /// `rows` must be in table order so grandparents are indexed before parents.
    fn build(rows: Vec<Row>) -> Self {
        let mut index = Self::default();
        for row in rows {
            match row {
                Row::Country(c) => {
                    index.countries.insert(c.code.clone(), Arc::new(c));
                }
                Row::Beatmapset(s) => {
                    index.beatmapsets.insert(s.id, Arc::new(s));
                }
                Row::User(mut u) => {
                    u.repoint(&index);
                    index.users.insert(u.id, Arc::new(u));
                }
                Row::Beatmap(mut b) => {
                    b.repoint(&index);
                    index.beatmaps.insert(b.id, Arc::new(b));
                }
                Row::Score(_) => {}
            }
        }
        index
    }
}

/// A persisted entity type.
pub trait Entity: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Into<RowKey> + Send + Sync;
    const TABLE: Table;

    fn key(&self) -> Self::Key;

    /// Row with parent references stripped.
    fn to_row(&self) -> Row;

    fn from_row(row: Row) -> Option<Self>;

    /// Rows implied by in-memory parent references, ancestors first.
    fn implied_parents(&self, _out: &mut Vec<Row>) {}

    /// Point parent references at the persisted parent instances.
    fn repoint(&mut self, _parents: &ParentIndex) {}
}

impl Entity for Country {
    type Key = String;
    const TABLE: Table = Table::Countries;

    fn key(&self) -> String {
        self.code.clone()
    }

    fn to_row(&self) -> Row {
        Row::Country(self.clone())
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Country(c) => Some(c),
            _ => None,
        }
    }
}

impl Entity for Beatmapset {
    type Key = i64;
    const TABLE: Table = Table::Beatmapsets;

    fn key(&self) -> i64 {
        self.id
    }

    fn to_row(&self) -> Row {
        Row::Beatmapset(self.clone())
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Beatmapset(s) => Some(s),
            _ => None,
        }
    }
}

impl Entity for User {
    type Key = i64;
    const TABLE: Table = Table::Users;

    fn key(&self) -> i64 {
        self.id
    }

    fn to_row(&self) -> Row {
        Row::User(User {
            country: None,
            ..self.clone()
        })
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::User(u) => Some(u),
            _ => None,
        }
    }

    fn implied_parents(&self, out: &mut Vec<Row>) {
        if let Some(country) = self.country.as_deref() {
            out.push(Row::Country(Country {
                code: self.country_code.clone(),
                name: country.name.clone(),
            }));
        }
    }

    fn repoint(&mut self, parents: &ParentIndex) {
        if let Some(country) = parents.countries.get(&self.country_code) {
            self.country = Some(country.clone());
        }
    }
}

impl Entity for Beatmap {
    type Key = i64;
    const TABLE: Table = Table::Beatmaps;

    fn key(&self) -> i64 {
        self.id
    }

    fn to_row(&self) -> Row {
        Row::Beatmap(Beatmap {
            beatmapset: None,
            ..self.clone()
        })
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Beatmap(b) => Some(b),
            _ => None,
        }
    }

    fn implied_parents(&self, out: &mut Vec<Row>) {
        if let Some(set) = self.beatmapset.as_deref() {
            out.push(Row::Beatmapset(Beatmapset {
                id: self.beatmapset_id,
                ..set.clone()
            }));
        }
    }

    fn repoint(&mut self, parents: &ParentIndex) {
        if let Some(set) = parents.beatmapsets.get(&self.beatmapset_id) {
            self.beatmapset = Some(set.clone());
        }
    }
}

impl Entity for Score {
    type Key = i64;
    const TABLE: Table = Table::Scores;

    fn key(&self) -> i64 {
        self.id
    }

    fn to_row(&self) -> Row {
        Row::Score(Score {
            beatmap: None,
            user: None,
            map_rank: None,
            ..self.clone()
        })
    }

    fn from_row(row: Row) -> Option<Self> {
        match row {
            Row::Score(s) => Some(s),
            _ => None,
        }
    }

    fn implied_parents(&self, out: &mut Vec<Row>) {
        if let Some(beatmap) = self.beatmap.as_deref() {
            beatmap.implied_parents(out);
            out.push(beatmap.to_row());
        }
        if let Some(user) = self.user.as_deref() {
            user.implied_parents(out);
            out.push(user.to_row());
        }
    }

    fn repoint(&mut self, parents: &ParentIndex) {
        if let Some(beatmap) = parents.beatmaps.get(&self.beatmap_id) {
            self.beatmap = Some(beatmap.clone());
        }
        if let Some(user) = parents.users.get(&self.user_id) {
            self.user = Some(user.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Entities of the requested type that were newly written.
    pub inserted: usize,
    /// Entities whose key was already stored (or repeated within the call).
    pub already_present: usize,
    /// Parent rows created on the way.
    pub parents_inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub updated: usize,
    /// Keys with no stored row; nothing is inserted for them.
    pub missing: Vec<RowKey>,
}

/// Keeps the first row per key, preserving order.
fn dedupe_rows(rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|r| seen.insert((r.table(), r.key())))
        .collect()
}

#[derive(Clone)]
pub struct EntityUpsertStore {
    backend: Arc<dyn StoreBackend>,
}

impl EntityUpsertStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Queue inserts for parents of `entities` that are not stored yet, and return
    /// the persisted parent set (stored rows win over the in-memory copies).
    async fn resolve_parents<'a, E: Entity>(
        &self,
        entities: impl Iterator<Item = &'a E>,
        batch: &mut WriteBatch,
    ) -> Result<ParentIndex> {
        let mut implied = Vec::new();
        for e in entities {
            e.implied_parents(&mut implied);
        }
        let mut by_table: BTreeMap<Table, Vec<Row>> = BTreeMap::new();
        for row in dedupe_rows(implied) {
            by_table.entry(row.table()).or_default().push(row);
        }

        let mut persisted = Vec::new();
        for (table, rows) in by_table {
            let keys: Vec<RowKey> = rows.iter().map(Row::key).collect();
            let stored = self.backend.fetch_rows(table, &keys).await?;
            let stored_keys: HashSet<RowKey> = stored.iter().map(Row::key).collect();
            persisted.extend(stored);
            for row in rows {
                if !stored_keys.contains(&row.key()) {
                    batch.inserts.push(row.clone());
                    persisted.push(row);
                }
            }
        }
        persisted.sort_by_key(|r| r.table());
        Ok(ParentIndex::build(persisted))
    }

    pub async fn create_one<E: Entity>(&self, entity: &mut E) -> Result<CreateOutcome> {
        self.create_many(std::slice::from_mut(entity)).await
    }

    /// Insert every entity whose key is not stored yet, together with any new
    /// parents they reference, in one atomic write.
    #[instrument(skip(self, entities), fields(table = E::TABLE.name(), count = entities.len()))]
    pub async fn create_many<E: Entity>(&self, entities: &mut [E]) -> Result<CreateOutcome> {
        if entities.is_empty() {
            return Ok(CreateOutcome::default());
        }
        let mut batch = WriteBatch::default();
        let parents = self.resolve_parents(entities.iter(), &mut batch).await?;
        let parents_queued = batch.inserts.len();

        let own = dedupe_rows(entities.iter().map(Entity::to_row));
        let keys: Vec<RowKey> = own.iter().map(Row::key).collect();
        let existing = self.backend.existing_keys(E::TABLE, &keys).await?;
        batch
            .inserts
            .extend(own.into_iter().filter(|r| !existing.contains(&r.key())));

        let outcome = if batch.is_empty() {
            WriteOutcome::default()
        } else {
            self.backend.apply(batch).await?
        };
        for e in entities.iter_mut() {
            e.repoint(&parents);
        }

        let inserted = outcome.inserted(E::TABLE);
        let result = CreateOutcome {
            inserted,
            already_present: entities.len() - inserted,
            parents_inserted: outcome
                .inserted
                .iter()
                .filter(|(t, _)| **t != E::TABLE)
                .map(|(_, n)| n)
                .sum(),
        };
        debug!(?result, parents_queued, "create_many applied");
        Ok(result)
    }

    pub async fn update_one<E: Entity>(&self, entity: &mut E) -> Result<UpdateOutcome> {
        self.update_many(std::slice::from_mut(entity)).await
    }

    /// Overwrite stored rows with `entities`. Keys that are not stored are
    /// reported in [`UpdateOutcome::missing`] and left alone.
    #[instrument(skip(self, entities), fields(table = E::TABLE.name(), count = entities.len()))]
    pub async fn update_many<E: Entity>(&self, entities: &mut [E]) -> Result<UpdateOutcome> {
        if entities.is_empty() {
            return Ok(UpdateOutcome::default());
        }
        let keys: Vec<RowKey> = entities.iter().map(|e| e.key().into()).collect();
        let existing = self.backend.existing_keys(E::TABLE, &keys).await?;

        let mut missing = Vec::new();
        let mut present = Vec::new();
        for (idx, key) in keys.into_iter().enumerate() {
            if existing.contains(&key) {
                present.push(idx);
            } else if !missing.contains(&key) {
                missing.push(key);
            }
        }

        let mut batch = WriteBatch::default();
        let parents = self
            .resolve_parents(present.iter().map(|&i| &entities[i]), &mut batch)
            .await?;
        batch.updates = dedupe_rows(present.iter().map(|&i| entities[i].to_row()));

        let outcome = if batch.is_empty() {
            WriteOutcome::default()
        } else {
            self.backend.apply(batch).await?
        };
        for &i in &present {
            entities[i].repoint(&parents);
        }
        Ok(UpdateOutcome {
            updated: outcome.updated(E::TABLE),
            missing,
        })
    }

    pub async fn delete_one<E: Entity>(&self, key: E::Key) -> Result<usize> {
        self.delete_many::<E>(&[key]).await
    }

    /// Remove rows by key. Dependents are never removed implicitly; deleting a
    /// referenced row is an error.
    #[instrument(skip(self, keys), fields(table = E::TABLE.name(), count = keys.len()))]
    pub async fn delete_many<E: Entity>(&self, keys: &[E::Key]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let batch = WriteBatch {
            deletes: keys
                .iter()
                .cloned()
                .map(|k| (E::TABLE, k.into()))
                .collect(),
            ..WriteBatch::default()
        };
        Ok(self.backend.apply(batch).await?.deleted(E::TABLE))
    }

    pub async fn get<E: Entity>(&self, key: E::Key) -> Result<Option<E>> {
        Ok(self.get_many::<E>(&[key]).await?.into_iter().next())
    }

    pub async fn get_many<E: Entity>(&self, keys: &[E::Key]) -> Result<Vec<E>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<RowKey> = keys.iter().cloned().map(Into::into).collect();
        let rows = self.backend.fetch_rows(E::TABLE, &keys).await?;
        Ok(rows.into_iter().filter_map(E::from_row).collect())
    }

    /// Which of `keys` are stored, in one batched lookup.
    pub async fn existing_keys<E: Entity>(&self, keys: &[E::Key]) -> Result<HashSet<E::Key>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let row_keys: Vec<RowKey> = keys.iter().cloned().map(Into::into).collect();
        let found = self.backend.existing_keys(E::TABLE, &row_keys).await?;
        Ok(keys
            .iter()
            .filter(|k| {
                let key: RowKey = (*k).clone().into();
                found.contains(&key)
            })
            .cloned()
            .collect())
    }
}
