//! Engine configuration.
//!
//! Every threshold is a global constant for a run: it is applied uniformly to
//! all actors and never tuned per actor. All fields can be overridden from a
//! JSON file without code changes; missing fields fall back to the defaults
//! below.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::features::FeatureScales;

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // -- Latency bands -------------------------------------------------------
    /// Normalized latency strictly below this is firmware.
    pub firmware_cutoff: f64,
    /// Normalized latency strictly above this is System-2.
    pub system2_cutoff: f64,

    // -- Trailing baseline ---------------------------------------------------
    /// Number of prior eligible events in the trailing mean.
    pub baseline_window: usize,
    /// Eligible events required before the trailing mean is defined.
    pub baseline_min_history: usize,
    /// Latencies below this are treated as pre-committed (premoves).
    pub precommit_floor_secs: f64,
    /// Remaining budget below this is acute time pressure.
    pub time_pressure_floor_secs: f64,

    // -- Outcome severity tiers (quality units) ------------------------------
    pub severe_threshold: f64,
    pub moderate_threshold: f64,
    pub minor_threshold: f64,

    // -- Trigger metrics -----------------------------------------------------
    /// Alternatives within this margin of the best count as near-optimal.
    pub near_optimal_margin: f64,
    /// Best-vs-second gap at or above this means "only one good option".
    pub criticality_gap_threshold: f64,
    /// Relative optionality change at or below this is "sharply shrinking".
    pub optionality_shrink_threshold: f64,
    /// Preceding external actions ranked beyond this are surprises.
    pub surprise_top_k: usize,
    /// Gradient that saturates the composite trigger score.
    pub gradient_signal_cap: f64,
    /// Criticality gap that saturates the composite trigger score.
    pub criticality_signal_cap: f64,
    /// Complexity score separating misfires from pattern slips.
    pub high_complexity_threshold: f64,

    // -- Clustering ----------------------------------------------------------
    /// Fixed K. When unset, K scales with the epoch size up to `max_cluster_k`.
    pub cluster_k: Option<usize>,
    pub max_cluster_k: usize,
    pub kmeans_max_iters: usize,
    pub kmeans_tol: f64,
    /// Seed for k-means++ initialization. Changing it changes cluster ids.
    pub cluster_seed: u64,
    pub min_cluster_population: usize,

    // -- Segmentation --------------------------------------------------------
    /// Start instants of every epoch after the first.
    pub epoch_boundaries: Vec<DateTime<Utc>>,
    /// Start instants of every period after the first.
    pub period_boundaries: Vec<DateTime<Utc>>,

    // -- Aggregate floors ----------------------------------------------------
    pub min_actor_cluster_samples: usize,
    /// Severe-outcome rate a cluster must stay below to count as firmware.
    pub firmware_error_ceiling: f64,
    pub min_growth_periods: usize,
    pub min_test_samples: usize,

    // -- Feature scaling -----------------------------------------------------
    pub feature_scales: FeatureScales,
    /// Phase strictly above this is the early stage.
    pub early_stage_cutoff: f64,
    /// Phase at or below this is the late stage.
    pub late_stage_cutoff: f64,

    // -- Latency signature ---------------------------------------------------
    /// Middle/early median ratio at or above which a sandwich is strong.
    pub strong_trigger_ratio: f64,
    /// Ratio at or above which the style reads as speed-first.
    pub speed_style_ratio: f64,
    /// Ratio at or above which the style reads as balanced.
    pub balanced_style_ratio: f64,

    // -- Statistical tests ---------------------------------------------------
    /// Lower edges of skill bands; the last band is open-ended.
    pub skill_bands: Vec<f64>,
    pub min_actors_per_band: usize,
    /// Minimum declared skill for the ceiling/floor cohort.
    pub cohort_min_skill: f64,
    /// Share of the cohort a cluster must be observed in to qualify.
    pub cohort_presence_fraction: f64,
    /// Share of present actors that must be System-2 for a ceiling.
    pub ceiling_agreement: f64,
    /// Favorable evaluation swing that arms the advantage trap.
    pub advantage_swing_threshold: f64,
    pub bad_firmware_min_obs: usize,
    pub bad_firmware_error_rate: f64,
    /// Share of records held out when scoring the blunder model.
    pub holdout_fraction: f64,
    pub logistic_max_iters: usize,

    // -- Comparison ----------------------------------------------------------
    pub divergence_threshold: f64,

    // -- Oracle --------------------------------------------------------------
    pub oracle_timeout_ms: u64,
    pub oracle_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            firmware_cutoff: 0.7,
            system2_cutoff: 1.5,
            baseline_window: 50,
            baseline_min_history: 5,
            precommit_floor_secs: 0.5,
            time_pressure_floor_secs: 30.0,
            severe_threshold: 100.0,
            moderate_threshold: 50.0,
            minor_threshold: 25.0,
            near_optimal_margin: 50.0,
            criticality_gap_threshold: 100.0,
            optionality_shrink_threshold: -0.5,
            surprise_top_k: 5,
            gradient_signal_cap: 100.0,
            criticality_signal_cap: 200.0,
            high_complexity_threshold: 0.5,
            cluster_k: None,
            max_cluster_k: 100,
            kmeans_max_iters: 100,
            kmeans_tol: 1e-6,
            cluster_seed: 1337,
            min_cluster_population: 20,
            epoch_boundaries: Vec::new(),
            period_boundaries: Vec::new(),
            min_actor_cluster_samples: 50,
            firmware_error_ceiling: 0.1,
            min_growth_periods: 2,
            min_test_samples: 30,
            feature_scales: FeatureScales::default(),
            early_stage_cutoff: 0.7,
            late_stage_cutoff: 0.3,
            strong_trigger_ratio: 1.3,
            speed_style_ratio: 2.0,
            balanced_style_ratio: 1.5,
            skill_bands: vec![
                1000.0, 1200.0, 1400.0, 1600.0, 1800.0, 2000.0, 2200.0, 2500.0,
            ],
            min_actors_per_band: 3,
            cohort_min_skill: 2200.0,
            cohort_presence_fraction: 0.8,
            ceiling_agreement: 0.9,
            advantage_swing_threshold: 100.0,
            bad_firmware_min_obs: 5,
            bad_firmware_error_rate: 0.5,
            holdout_fraction: 0.3,
            logistic_max_iters: 50,
            divergence_threshold: 0.5,
            oracle_timeout_ms: 10_000,
            oracle_concurrency: 8,
        }
    }
}

impl EngineConfig {
    /// Load a configuration file and validate it.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: EngineConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if !(self.firmware_cutoff > 0.0 && self.firmware_cutoff.is_finite()) {
            return fail("firmware_cutoff must be a positive finite number");
        }
        if !(self.system2_cutoff.is_finite() && self.system2_cutoff >= self.firmware_cutoff) {
            return fail("system2_cutoff must be finite and >= firmware_cutoff");
        }
        if !(self.minor_threshold > 0.0
            && self.minor_threshold <= self.moderate_threshold
            && self.moderate_threshold <= self.severe_threshold)
        {
            return fail("severity tiers must satisfy 0 < minor <= moderate <= severe");
        }
        if self.baseline_window == 0 {
            return fail("baseline_window must be > 0");
        }
        if self.baseline_min_history == 0 || self.baseline_min_history > self.baseline_window {
            return fail("baseline_min_history must be in 1..=baseline_window");
        }
        if self.cluster_k == Some(0) || self.max_cluster_k == 0 {
            return fail("cluster k must be > 0");
        }
        if self.kmeans_max_iters == 0 || !(self.kmeans_tol > 0.0) {
            return fail("kmeans_max_iters and kmeans_tol must be > 0");
        }
        if self.min_actor_cluster_samples == 0 || self.min_test_samples < 3 {
            return fail("sample floors must be positive (min_test_samples >= 3)");
        }
        for (name, v) in [
            ("firmware_error_ceiling", self.firmware_error_ceiling),
            ("cohort_presence_fraction", self.cohort_presence_fraction),
            ("ceiling_agreement", self.ceiling_agreement),
            ("bad_firmware_error_rate", self.bad_firmware_error_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::InvalidConfig(format!("{name} must be in [0, 1]")));
            }
        }
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return fail("holdout_fraction must be in (0, 1)");
        }
        if self.skill_bands.windows(2).any(|w| w[0] >= w[1]) {
            return fail("skill_bands must be strictly increasing");
        }
        if !is_sorted(&self.epoch_boundaries) || !is_sorted(&self.period_boundaries) {
            return fail("epoch and period boundaries must be strictly increasing");
        }
        if !(0.0..=1.0).contains(&self.late_stage_cutoff)
            || !(0.0..=1.0).contains(&self.early_stage_cutoff)
            || self.late_stage_cutoff >= self.early_stage_cutoff
        {
            return fail("stage cutoffs must satisfy 0 <= late < early <= 1");
        }
        if self.balanced_style_ratio > self.speed_style_ratio {
            return fail("balanced_style_ratio must be <= speed_style_ratio");
        }
        if self.oracle_concurrency == 0 {
            return fail("oracle_concurrency must be > 0");
        }
        self.feature_scales.validate()
    }

    /// Number of clusters to build for an epoch holding `n` vectors.
    pub fn effective_k(&self, n: usize) -> usize {
        match self.cluster_k {
            Some(k) => k,
            None => {
                // Keep roughly `min_cluster_population` members per cluster.
                let per = self.min_cluster_population.max(1);
                (n / per).clamp(1, self.max_cluster_k)
            }
        }
    }

    /// Index of the epoch containing `ts`.
    pub fn epoch_index(&self, ts: DateTime<Utc>) -> usize {
        segment_index(&self.epoch_boundaries, ts)
    }

    /// Index of the period containing `ts`.
    pub fn period_index(&self, ts: DateTime<Utc>) -> usize {
        segment_index(&self.period_boundaries, ts)
    }
}

fn is_sorted(v: &[DateTime<Utc>]) -> bool {
    v.windows(2).all(|w| w[0] < w[1])
}

fn segment_index(boundaries: &[DateTime<Utc>], ts: DateTime<Utc>) -> usize {
    boundaries.partition_point(|b| *b <= ts)
}
