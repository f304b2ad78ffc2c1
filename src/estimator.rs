//! Performance estimation for scores that arrive without `pp`.
//!
//! The real calculator is an opaque collaborator behind [`PerformanceEstimator`].
//! [`HeuristicEstimator`] is a self-contained stand-in that reads the beatmap's
//! `.osu` text and scales a star-rating curve by accuracy, misses and length.
use anyhow::{bail, Context, Result};

use crate::database_ops::models::Score;
use crate::normalization::HitResult;

pub trait PerformanceEstimator: Send + Sync {
    /// Estimate `pp` for `score` played on the beatmap whose raw file is `beatmap_file`.
    fn estimate(&self, score: &Score, beatmap_file: &[u8]) -> Result<f32>;
}

/// Difficulty attributes read from a `.osu` file.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatmapAttributes {
    pub hp_drain: f32,
    pub circle_size: f32,
    pub overall_difficulty: f32,
    pub approach_rate: f32,
    pub slider_multiplier: f32,
    pub object_count: u32,
}

impl BeatmapAttributes {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).context("beatmap file is not utf-8")?;
        let mut lines = text.lines().map(str::trim);
        match lines.next() {
            Some(header) if header.trim_start_matches('\u{feff}').starts_with("osu file format") => {}
            _ => bail!("missing osu file format header"),
        }

        let mut section = "";
        let mut attrs = BeatmapAttributes {
            hp_drain: 5.0,
            circle_size: 5.0,
            overall_difficulty: 5.0,
            approach_rate: f32::NAN,
            slider_multiplier: 1.4,
            object_count: 0,
        };
        for line in lines {
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = &line[1..line.len() - 1];
                continue;
            }
            match section {
                "Difficulty" => {
                    let Some((key, value)) = line.split_once(':') else { continue };
                    let value: f32 = value
                        .trim()
                        .parse()
                        .with_context(|| format!("bad difficulty value for {key}"))?;
                    match key.trim() {
                        "HPDrainRate" => attrs.hp_drain = value,
                        "CircleSize" => attrs.circle_size = value,
                        "OverallDifficulty" => attrs.overall_difficulty = value,
                        "ApproachRate" => attrs.approach_rate = value,
                        "SliderMultiplier" => attrs.slider_multiplier = value,
                        _ => {}
                    }
                }
                "HitObjects" => attrs.object_count += 1,
                _ => {}
            }
        }
        // Old formats have no ApproachRate; it follows OD.
        if attrs.approach_rate.is_nan() {
            attrs.approach_rate = attrs.overall_difficulty;
        }
        if attrs.object_count == 0 {
            bail!("beatmap has no hit objects");
        }
        Ok(attrs)
    }

    /// Rough star rating from the map settings, used when the score carries no beatmap.
    fn approximate_stars(&self) -> f32 {
        let density = (self.object_count as f32 / 500.0).min(2.0);
        0.25 * self.approach_rate + 0.2 * self.overall_difficulty + 0.1 * self.circle_size + density
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    fn mod_multiplier(score: &Score) -> f32 {
        score
            .mod_acronyms
            .iter()
            .map(|m| match m.split('(').next().unwrap_or(m.as_str()) {
                "NF" => 0.9,
                "SO" => 0.95,
                "HD" => 1.06,
                "FL" => 1.12,
                _ => 1.0,
            })
            .product()
    }
}

impl PerformanceEstimator for HeuristicEstimator {
    fn estimate(&self, score: &Score, beatmap_file: &[u8]) -> Result<f32> {
        let attrs = BeatmapAttributes::parse(beatmap_file)?;
        let stars = score
            .beatmap
            .as_ref()
            .map(|b| b.difficulty_rating)
            .filter(|s| *s > 0.0)
            .unwrap_or_else(|| attrs.approximate_stars());

        let base = (5.0 * (stars / 0.0675).max(1.0) - 4.0).powi(3) / 100_000.0;
        let objects = attrs.object_count as f32;
        let mut length_bonus = 0.95 + 0.4 * (objects / 2000.0).min(1.0);
        if objects > 2000.0 {
            length_bonus += (objects / 2000.0).log10() * 0.5;
        }
        let misses = score.statistics.get(&HitResult::Miss).copied().unwrap_or(0);
        let miss_penalty = 0.97f32.powi(misses.min(i32::MAX as u32) as i32);
        let accuracy = score.accuracy.clamp(0.0, 1.0);

        let pp = base * length_bonus * miss_penalty * accuracy.powf(5.5) * Self::mod_multiplier(score) * 1.14;
        if !pp.is_finite() {
            bail!("estimate is not finite");
        }
        Ok(pp.max(0.0))
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_BEATMAP: &str = "osu file format v14\n\n[General]\nMode: 0\n\n[Difficulty]\nHPDrainRate:5\nCircleSize:4\nOverallDifficulty:8\nApproachRate:9.3\nSliderMultiplier:1.8\n\n[HitObjects]\n256,192,1000,1,0,0:0:0:0:\n300,200,1500,1,0,0:0:0:0:\n";
