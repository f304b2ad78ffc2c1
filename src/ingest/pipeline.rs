//! Shared persist path for every batch of scores pulled from upstream.
//!
//! Parents are guaranteed first: missing users and beatmaps are fetched in
//! batches of [`MAX_BATCH_IDS`] and created before any score that references
//! them. Scores without `pp` get an estimate from the beatmap's raw file.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::database_ops::models::{Beatmap, Beatmapset, Country, Score, User};
use crate::database_ops::EntityUpsertStore;
use crate::estimator::PerformanceEstimator;
use crate::normalization::derive_acronyms;
use crate::osu_api::{OsuApi, MAX_BATCH_IDS};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistSummary {
    pub received: usize,
    pub inserted: usize,
    /// Scores whose user or beatmap upstream did not return.
    pub dropped: usize,
    pub users_fetched: usize,
    pub beatmaps_fetched: usize,
    pub estimated: usize,
    pub estimate_failures: usize,
    /// Leaderboards that could not be fetched or stored.
    pub failed: usize,
}

impl PersistSummary {
    pub fn absorb(&mut self, other: PersistSummary) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.dropped += other.dropped;
        self.users_fetched += other.users_fetched;
        self.beatmaps_fetched += other.beatmaps_fetched;
        self.estimated += other.estimated;
        self.estimate_failures += other.estimate_failures;
        self.failed += other.failed;
    }
}

fn distinct(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    ids.sorted_unstable().dedup().collect()
}

pub struct ScorePipeline {
    api: Arc<OsuApi>,
    store: EntityUpsertStore,
    estimator: Arc<dyn PerformanceEstimator>,
}

impl ScorePipeline {
    pub fn new(
        api: Arc<OsuApi>,
        store: EntityUpsertStore,
        estimator: Arc<dyn PerformanceEstimator>,
    ) -> Self {
        Self {
            api,
            store,
            estimator,
        }
    }

    pub fn api(&self) -> &Arc<OsuApi> {
        &self.api
    }

    pub fn store(&self) -> &EntityUpsertStore {
        &self.store
    }

    #[instrument(skip_all, fields(count = scores.len()))]
    pub async fn persist_scores(
        &self,
        scores: Vec<Score>,
        cancel: &CancellationToken,
    ) -> Result<PersistSummary> {
        let mut summary = PersistSummary {
            received: scores.len(),
            ..PersistSummary::default()
        };
        if scores.is_empty() {
            return Ok(summary);
        }

        let user_ids = distinct(scores.iter().map(|s| s.user_id));
        let beatmap_ids = distinct(scores.iter().map(|s| s.beatmap_id));
        let (users, users_fetched) = self.ensure_users(&user_ids, cancel).await?;
        let (beatmaps, beatmaps_fetched) = self.ensure_beatmaps(&beatmap_ids, cancel).await?;
        summary.users_fetched = users_fetched;
        summary.beatmaps_fetched = beatmaps_fetched;

        let mut scores: Vec<Score> = scores
            .into_iter()
            .filter(|s| users.contains(&s.user_id) && beatmaps.contains(&s.beatmap_id))
            .collect();
        summary.dropped = summary.received - scores.len();
        if summary.dropped > 0 {
            warn!(dropped = summary.dropped, "scores with unresolvable user or beatmap skipped");
        }
        for s in &mut scores {
            s.mod_acronyms = derive_acronyms(&s.mods);
        }

        let (mut known, mut unknown): (Vec<Score>, Vec<Score>) =
            scores.into_iter().partition(|s| s.pp.is_some());

        if !known.is_empty() {
            let out = self
                .store
                .create_many(&mut known)
                .await
                .context("persisting scores with pp")?;
            summary.inserted += out.inserted;
        }

        if !unknown.is_empty() {
            let ids: Vec<i64> = unknown.iter().map(|s| s.id).collect();
            let stored = self.store.existing_keys::<Score>(&ids).await?;
            unknown.retain(|s| !stored.contains(&s.id));
            if !unknown.is_empty() {
                summary.estimate_failures = self.estimate(&mut unknown, cancel).await?;
                summary.estimated = unknown.len();
                let out = self
                    .store
                    .create_many(&mut unknown)
                    .await
                    .context("persisting estimated scores")?;
                summary.inserted += out.inserted;
            }
        }

        info!(
            received = summary.received,
            inserted = summary.inserted,
            estimated = summary.estimated,
            "scores persisted"
        );
        Ok(summary)
    }

    /// Ids of users now stored, and how many were fetched to get there.
    async fn ensure_users(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<(HashSet<i64>, usize)> {
        let mut available = self.store.existing_keys::<User>(ids).await?;
        let missing: Vec<i64> = ids.iter().copied().filter(|id| !available.contains(id)).collect();
        let mut fetched = 0;
        for chunk in missing.chunks(MAX_BATCH_IDS) {
            let mut users = self.api.users(chunk, cancel).await?;
            for u in &mut users {
                if u.country.is_none() {
                    u.country = Some(Arc::new(Country {
                        code: u.country_code.clone(),
                        name: u.country_code.clone(),
                    }));
                }
            }
            self.store
                .create_many(&mut users)
                .await
                .context("persisting fetched users")?;
            fetched += users.len();
            available.extend(users.iter().map(|u| u.id));
        }
        debug!(requested = ids.len(), fetched, "users resolved");
        Ok((available, fetched))
    }

    async fn ensure_beatmaps(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<(HashSet<i64>, usize)> {
        let mut available = self.store.existing_keys::<Beatmap>(ids).await?;
        let missing: Vec<i64> = ids.iter().copied().filter(|id| !available.contains(id)).collect();
        let mut fetched = 0;
        for chunk in missing.chunks(MAX_BATCH_IDS) {
            let mut beatmaps = self.api.beatmaps(chunk, cancel).await?;
            for b in &mut beatmaps {
                if b.beatmapset.is_none() {
                    b.beatmapset = Some(Arc::new(Beatmapset {
                        id: b.beatmapset_id,
                        artist: String::new(),
                        title: String::new(),
                        preview_url: None,
                    }));
                }
            }
            self.store
                .create_many(&mut beatmaps)
                .await
                .context("persisting fetched beatmaps")?;
            fetched += beatmaps.len();
            available.extend(beatmaps.iter().map(|b| b.id));
        }
        debug!(requested = ids.len(), fetched, "beatmaps resolved");
        Ok((available, fetched))
    }

    /// Fill `pp` on every score. Each beatmap file is fetched once; any fetch or
    /// estimator failure yields 0.0 for the affected scores. Returns the failure count.
    async fn estimate(&self, scores: &mut [Score], cancel: &CancellationToken) -> Result<usize> {
        let ids = distinct(scores.iter().map(|s| s.beatmap_id));
        let stored: HashMap<i64, Arc<Beatmap>> = self
            .store
            .get_many::<Beatmap>(&ids)
            .await?
            .into_iter()
            .map(|b| (b.id, Arc::new(b)))
            .collect();

        let mut files: HashMap<i64, Bytes> = HashMap::new();
        for id in ids {
            match self.api.beatmap_file(id, cancel).await {
                Ok(bytes) => {
                    files.insert(id, bytes);
                }
                Err(e) if e.is_cancelled() => return Err(e.into()),
                Err(e) => warn!(beatmap_id = id, error = %e, "beatmap file unavailable; using 0 pp"),
            }
        }

        let mut failures = 0;
        for s in scores.iter_mut() {
            if s.beatmap.is_none() {
                s.beatmap = stored.get(&s.beatmap_id).cloned();
            }
            let pp = match files.get(&s.beatmap_id) {
                Some(file) => match self.estimator.estimate(s, file) {
                    Ok(pp) => pp,
                    Err(e) => {
                        warn!(score_id = s.id, beatmap_id = s.beatmap_id, error = %e, "pp estimation failed; using 0");
                        failures += 1;
                        0.0
                    }
                },
                None => {
                    failures += 1;
                    0.0
                }
            };
            s.pp = Some(pp);
        }
        Ok(failures)
    }
}
