//! Statistical analysis over friction records and firmware profiles.
//!
//! Each named test returns a typed report plus flat [`TestResult`] rows for
//! the `tests.jsonl` table. Anything below its sample floor, or numerically
//! degenerate, is reported as [`TestOutcome::Insufficient`]; it is a value,
//! never an error.

pub mod stats;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::ClusterRef;
use crate::config::EngineConfig;
use crate::friction::{Band, FrictionLevel, FrictionRecord};
use crate::profile::FirmwareProfile;

use stats::{Contingency, LogisticModel};

// ---------------------------------------------------------------------
//  Result rows
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Computed { statistic: f64, p_value: Option<f64> },
    Insufficient { floor: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub metric: String,
    pub sample_size: usize,
    pub outcome: TestOutcome,
}

impl TestResult {
    pub fn computed(metric: impl Into<String>, n: usize, statistic: f64, p_value: Option<f64>) -> Self {
        Self {
            metric: metric.into(),
            sample_size: n,
            outcome: TestOutcome::Computed { statistic, p_value },
        }
    }

    pub fn insufficient(metric: impl Into<String>, n: usize, floor: usize) -> Self {
        Self {
            metric: metric.into(),
            sample_size: n,
            outcome: TestOutcome::Insufficient { floor },
        }
    }

    pub fn statistic(&self) -> Option<f64> {
        match self.outcome {
            TestOutcome::Computed { statistic, .. } => Some(statistic),
            TestOutcome::Insufficient { .. } => None,
        }
    }

    pub fn p_value(&self) -> Option<f64> {
        match self.outcome {
            TestOutcome::Computed { p_value, .. } => p_value,
            TestOutcome::Insufficient { .. } => None,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self.outcome, TestOutcome::Insufficient { .. })
    }
}

fn indicator(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn evaluated(records: &[FrictionRecord]) -> impl Iterator<Item = &FrictionRecord> {
    records.iter().filter(|r| r.severity.is_some() && !r.forced)
}

// ---------------------------------------------------------------------
//  Complexity × latency × error
// ---------------------------------------------------------------------

/// How situation complexity is measured for quartiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityProxy {
    Score,
    NearOptimal,
}

/// Which records enter a test, by time-pressure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureFilter {
    All,
    Unpressured,
    Pressured,
}

impl PressureFilter {
    pub fn admits(&self, r: &FrictionRecord) -> bool {
        match self {
            PressureFilter::All => true,
            PressureFilter::Unpressured => !r.time_pressure,
            PressureFilter::Pressured => r.time_pressure,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PressureFilter::All => "all",
            PressureFilter::Unpressured => "unpressured",
            PressureFilter::Pressured => "pressured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuartileResult {
    /// 1 = least complex.
    pub quartile: usize,
    /// Proxy range of the quartile. `None` when it is empty.
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub result: TestResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityReport {
    pub proxy: ComplexityProxy,
    pub filter: PressureFilter,
    pub quartiles: Vec<QuartileResult>,
}

/// Point-biserial correlation between normalized latency and a severe
/// outcome, within each complexity quartile.
pub fn complexity_latency_error(
    records: &[FrictionRecord],
    proxy: ComplexityProxy,
    filter: PressureFilter,
    cfg: &EngineConfig,
) -> ComplexityReport {
    let mut rows: Vec<(f64, &FrictionRecord)> = evaluated(records)
        .filter(|r| filter.admits(r))
        .filter_map(|r| {
            let c = match proxy {
                ComplexityProxy::Score => Some(r.complexity),
                ComplexityProxy::NearOptimal => r.near_optimal.map(|n| n as f64),
            };
            c.map(|c| (c, r))
        })
        .collect();
    rows.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n = rows.len();
    let mut quartiles = Vec::with_capacity(4);
    for q in 0..4 {
        let start = q * n / 4;
        let end = (q + 1) * n / 4;
        let slice = &rows[start..end];
        let metric = format!(
            "complexity_latency_error.{}.{}.q{}",
            match proxy {
                ComplexityProxy::Score => "score",
                ComplexityProxy::NearOptimal => "near_optimal",
            },
            filter.label(),
            q + 1
        );
        let lower = slice.first().map(|(c, _)| *c);
        let upper = slice.last().map(|(c, _)| *c);
        let result = if slice.len() < cfg.min_test_samples {
            TestResult::insufficient(metric, slice.len(), cfg.min_test_samples)
        } else {
            let x: Vec<f64> = slice.iter().map(|(_, r)| r.normalized_latency).collect();
            let y: Vec<f64> = slice.iter().map(|(_, r)| indicator(r.is_severe())).collect();
            match stats::correlation_test(&x, &y) {
                Some(t) => TestResult::computed(metric, slice.len(), t.r, Some(t.p_value)),
                None => TestResult::insufficient(metric, slice.len(), cfg.min_test_samples),
            }
        };
        quartiles.push(QuartileResult {
            quartile: q + 1,
            lower,
            upper,
            result,
        });
    }
    ComplexityReport {
        proxy,
        filter,
        quartiles,
    }
}

// ---------------------------------------------------------------------
//  Coverage by skill band
// ---------------------------------------------------------------------

fn band_index(skill: f64, edges: &[f64]) -> Option<usize> {
    let k = edges.partition_point(|e| *e <= skill);
    k.checked_sub(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandCoverage {
    pub lower: f64,
    pub upper: Option<f64>,
    pub actors: usize,
    /// `None` below `min_actors_per_band`.
    pub mean_coverage: Option<f64>,
    /// Actors with at least one evaluated firmware cluster.
    pub error_actors: usize,
    /// Mean severe rate inside firmware clusters. `None` below
    /// `min_actors_per_band`.
    pub mean_firmware_error_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillBandReport {
    pub bands: Vec<BandCoverage>,
    /// Spearman correlation of band index against mean coverage.
    pub trend: TestResult,
    /// Bands whose coverage falls below the previous sufficient band.
    pub deviations: Vec<usize>,
    /// Spearman correlation of band index against firmware error rate.
    pub error_trend: TestResult,
    /// Bands whose firmware error rate rises above the previous sufficient band.
    pub error_deviations: Vec<usize>,
}

#[derive(Default)]
struct ActorSkillRow {
    coverages: Vec<f64>,
    firmware_errors: Vec<f64>,
    skills: Vec<f64>,
}

/// Indices whose value breaks the expected direction against the previous
/// present value.
fn trend_breaks(values: &[Option<f64>], rising: bool) -> Vec<usize> {
    let mut out = Vec::new();
    let mut last: Option<f64> = None;
    for (i, v) in values.iter().enumerate() {
        let Some(v) = *v else { continue };
        if let Some(prev) = last {
            if (rising && v < prev) || (!rising && v > prev) {
                out.push(i);
            }
        }
        last = Some(v);
    }
    out
}

fn band_trend(metric: &str, values: &[Option<f64>], n: usize) -> TestResult {
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i as f64, v)))
        .collect();
    if points.len() < 3 {
        return TestResult::insufficient(metric, n, 3);
    }
    let (x, y): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
    match stats::correlation_test(&stats::ranks(&x), &stats::ranks(&y)) {
        Some(t) => TestResult::computed(metric, n, t.r, Some(t.p_value)),
        None => TestResult::insufficient(metric, n, 3),
    }
}

pub fn coverage_by_skill_band(profiles: &[FirmwareProfile], cfg: &EngineConfig) -> SkillBandReport {
    let mut per_actor: BTreeMap<&str, ActorSkillRow> = BTreeMap::new();
    for p in profiles {
        let row = per_actor.entry(p.actor_id.as_str()).or_default();
        if let Some(c) = p.coverage.sufficient() {
            row.coverages.push(c.coverage);
            if let Some(acc) = c.firmware_accuracy {
                row.firmware_errors.push(1.0 - acc);
            }
        }
        if let Some(s) = p.mean_skill {
            row.skills.push(s);
        }
    }

    let edges = &cfg.skill_bands;
    let mut coverage_members: Vec<Vec<f64>> = vec![Vec::new(); edges.len()];
    let mut error_members: Vec<Vec<f64>> = vec![Vec::new(); edges.len()];
    for (actor, row) in &per_actor {
        let (Some(c), Some(s)) = (stats::mean(&row.coverages), stats::mean(&row.skills)) else {
            continue;
        };
        match band_index(s, edges) {
            Some(b) => {
                coverage_members[b].push(c);
                if let Some(e) = stats::mean(&row.firmware_errors) {
                    error_members[b].push(e);
                }
            }
            None => debug!(actor = *actor, skill = s, "actor below the lowest skill band"),
        }
    }

    let gated = |m: &[f64]| {
        if m.len() >= cfg.min_actors_per_band {
            stats::mean(m)
        } else {
            None
        }
    };
    let bands: Vec<BandCoverage> = coverage_members
        .iter()
        .zip(error_members.iter())
        .enumerate()
        .map(|(i, (cov, err))| BandCoverage {
            lower: edges[i],
            upper: edges.get(i + 1).copied(),
            actors: cov.len(),
            mean_coverage: gated(cov.as_slice()),
            error_actors: err.len(),
            mean_firmware_error_rate: gated(err.as_slice()),
        })
        .collect();

    let coverages: Vec<Option<f64>> = bands.iter().map(|b| b.mean_coverage).collect();
    let errors: Vec<Option<f64>> = bands.iter().map(|b| b.mean_firmware_error_rate).collect();
    let actors: usize = bands.iter().map(|b| b.actors).sum();
    let error_actors: usize = bands.iter().map(|b| b.error_actors).sum();

    SkillBandReport {
        trend: band_trend("coverage_by_skill_band.spearman", &coverages, actors),
        deviations: trend_breaks(&coverages, true),
        error_trend: band_trend("coverage_by_skill_band.firmware_error_spearman", &errors, error_actors),
        error_deviations: trend_breaks(&errors, false),
        bands,
    }
}

// ---------------------------------------------------------------------
//  Contingency-style tests
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyReport {
    pub table: Contingency,
    pub relative_risk: Option<f64>,
    pub result: TestResult,
}

fn contingency_report(metric: &str, table: Contingency, cfg: &EngineConfig) -> ContingencyReport {
    let n = table.total() as usize;
    let result = if n < cfg.min_test_samples {
        TestResult::insufficient(metric, n, cfg.min_test_samples)
    } else {
        match stats::chi_square_2x2(&table) {
            Some(c) => TestResult::computed(metric, n, c.statistic, Some(c.p_value)),
            None => TestResult::insufficient(metric, n, cfg.min_test_samples),
        }
    };
    ContingencyReport {
        table,
        relative_risk: table.relative_risk(),
        result,
    }
}

/// After a favorable evaluation swing, is a fast error more likely?
///
/// Rows split on the swing; the event is a severe outcome answered in the
/// firmware band. Slow severe outcomes count as "no fast error".
pub fn advantage_trap(records: &[FrictionRecord], cfg: &EngineConfig) -> ContingencyReport {
    let mut table = Contingency::default();
    for r in evaluated(records) {
        let Some(g) = r.triggers.as_ref().and_then(|t| t.evaluation_gradient) else {
            continue;
        };
        let fast_error = r.is_severe() && r.band == Band::Firmware;
        table.add(g >= cfg.advantage_swing_threshold, fast_error);
    }
    contingency_report("advantage_trap.chi_square", table, cfg)
}

/// Is a severe outcome more likely right after the actor moved into a
/// different cluster than the one of their previous decision?
pub fn context_shift_trap(records: &[FrictionRecord], cfg: &EngineConfig) -> ContingencyReport {
    let mut by_actor: BTreeMap<&str, Vec<&FrictionRecord>> = BTreeMap::new();
    for r in records {
        by_actor.entry(r.actor_id.as_str()).or_default().push(r);
    }
    let mut table = Contingency::default();
    for rs in by_actor.values_mut() {
        rs.sort_by_key(|r| r.timestamp);
        for w in rs.windows(2) {
            let (prev, cur) = (w[0], w[1]);
            if cur.severity.is_none() || cur.forced {
                continue;
            }
            table.add(prev.cluster != cur.cluster, cur.is_severe());
        }
    }
    contingency_report("context_shift_trap.chi_square", table, cfg)
}

/// Near-optimal alternatives existed but the actor did not slow down.
pub fn friction_gap_contingency(records: &[FrictionRecord], cfg: &EngineConfig) -> ContingencyReport {
    let mut table = Contingency::default();
    for r in evaluated(records).filter(|r| r.near_optimal.is_some()) {
        table.add(r.friction_gap, r.is_severe());
    }
    contingency_report("friction_gap.chi_square", table, cfg)
}

// ---------------------------------------------------------------------
//  Bad firmware
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadFirmware {
    pub actor_id: String,
    pub cluster: ClusterRef,
    pub fast_observations: usize,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadFirmwareReport {
    pub flagged: Vec<BadFirmware>,
    pub result: TestResult,
}

/// Clusters where an actor answers fast and is wrong more often than not.
pub fn bad_firmware(records: &[FrictionRecord], cfg: &EngineConfig) -> BadFirmwareReport {
    let mut groups: BTreeMap<(&str, ClusterRef), (usize, usize)> = BTreeMap::new();
    for r in evaluated(records).filter(|r| r.band == Band::Firmware) {
        let e = groups.entry((r.actor_id.as_str(), r.cluster)).or_default();
        e.0 += 1;
        if r.is_severe() {
            e.1 += 1;
        }
    }
    let examined = groups.values().filter(|(n, _)| *n >= cfg.bad_firmware_min_obs).count();
    let flagged: Vec<BadFirmware> = groups
        .into_iter()
        .filter(|(_, (n, _))| *n >= cfg.bad_firmware_min_obs)
        .filter_map(|((actor, cluster), (n, bad))| {
            let rate = bad as f64 / n as f64;
            (rate > cfg.bad_firmware_error_rate).then(|| BadFirmware {
                actor_id: actor.to_string(),
                cluster,
                fast_observations: n,
                error_rate: rate,
            })
        })
        .collect();
    let metric = "bad_firmware.flagged";
    let result = if examined == 0 {
        TestResult::insufficient(metric, 0, cfg.bad_firmware_min_obs)
    } else {
        TestResult::computed(metric, examined, flagged.len() as f64, None)
    };
    BadFirmwareReport { flagged, result }
}

// ---------------------------------------------------------------------
//  Ceiling / floor
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CeilingReport {
    pub cohort: Vec<String>,
    /// Clusters nearly every present expert still deliberates on.
    pub ceilings: Vec<ClusterRef>,
    /// Clusters nearly every present expert handles as firmware.
    pub floors: Vec<ClusterRef>,
    pub result: TestResult,
}

pub fn ceiling_floor(profiles: &[FirmwareProfile], cfg: &EngineConfig) -> CeilingReport {
    let mut skills: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for p in profiles {
        if let Some(s) = p.mean_skill {
            skills.entry(p.actor_id.as_str()).or_default().push(s);
        }
    }
    let cohort: Vec<&str> = skills
        .iter()
        .filter(|(_, s)| stats::mean(s).is_some_and(|m| m >= cfg.cohort_min_skill))
        .map(|(a, _)| *a)
        .collect();

    let metric = "ceiling_floor.clusters";
    if cohort.len() < cfg.min_actors_per_band {
        return CeilingReport {
            cohort: cohort.iter().map(|a| a.to_string()).collect(),
            ceilings: Vec::new(),
            floors: Vec::new(),
            result: TestResult::insufficient(metric, cohort.len(), cfg.min_actors_per_band),
        };
    }

    // (cluster, actor) -> band from the actor's latest sufficient period.
    let mut latest: BTreeMap<(ClusterRef, &str), (usize, Band)> = BTreeMap::new();
    for p in profiles.iter().filter(|p| cohort.contains(&p.actor_id.as_str())) {
        for c in &p.clusters {
            let Some(band) = c.band() else { continue };
            let slot = latest.entry((c.cluster, p.actor_id.as_str())).or_insert((p.period, band));
            if p.period >= slot.0 {
                *slot = (p.period, band);
            }
        }
    }
    let mut per_cluster: BTreeMap<ClusterRef, Vec<Band>> = BTreeMap::new();
    for ((cluster, _), (_, band)) in latest {
        per_cluster.entry(cluster).or_default().push(band);
    }

    let mut ceilings = Vec::new();
    let mut floors = Vec::new();
    let mut qualifying = 0usize;
    for (cluster, bands) in &per_cluster {
        let presence = bands.len() as f64 / cohort.len() as f64;
        if presence < cfg.cohort_presence_fraction {
            continue;
        }
        qualifying += 1;
        let share = |b: Band| bands.iter().filter(|x| **x == b).count() as f64 / bands.len() as f64;
        if share(Band::System2) >= cfg.ceiling_agreement {
            ceilings.push(*cluster);
        } else if share(Band::Firmware) >= cfg.ceiling_agreement {
            floors.push(*cluster);
        }
    }

    let result = if qualifying == 0 {
        let required = (cfg.cohort_presence_fraction * cohort.len() as f64).ceil() as usize;
        debug!(cohort = cohort.len(), required, "no cluster observed across enough of the cohort");
        TestResult::insufficient(metric, cohort.len(), required.max(1))
    } else {
        TestResult::computed(metric, cohort.len(), ceilings.len() as f64, None)
    };
    CeilingReport {
        cohort: cohort.iter().map(|a| a.to_string()).collect(),
        ceilings,
        floors,
        result,
    }
}

// ---------------------------------------------------------------------
//  Blunder prediction
// ---------------------------------------------------------------------

pub const BLUNDER_FEATURES: [&str; 4] = ["normalized_latency", "complexity", "trigger_score", "time_pressure"];

fn blunder_features(r: &FrictionRecord) -> Vec<f64> {
    vec![
        r.normalized_latency,
        r.complexity,
        r.triggers.as_ref().map_or(0.0, |t| t.trigger_score),
        indicator(r.time_pressure),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlunderModelReport {
    pub features: Vec<String>,
    pub model: Option<LogisticModel>,
    pub train_size: usize,
    pub holdout_size: usize,
    /// ROC-AUC on the held-out records only.
    pub result: TestResult,
}

impl BlunderModelReport {
    /// Sign of each feature coefficient (intercept excluded).
    pub fn coefficient_signs(&self) -> Vec<(String, f64)> {
        match &self.model {
            Some(m) => self
                .features
                .iter()
                .cloned()
                .zip(m.coefficients[1..].iter().map(|c| c.signum()))
                .collect(),
            None => Vec::new(),
        }
    }
}

pub fn blunder_prediction(records: &[FrictionRecord], cfg: &EngineConfig) -> BlunderModelReport {
    let rows: Vec<&FrictionRecord> = evaluated(records).collect();
    let metric = "blunder_prediction.auc";
    let features = BLUNDER_FEATURES.iter().map(|s| s.to_string()).collect();
    let n = rows.len();
    let insufficient = |train_size, holdout_size| BlunderModelReport {
        features: BLUNDER_FEATURES.iter().map(|s| s.to_string()).collect(),
        model: None,
        train_size,
        holdout_size,
        result: TestResult::insufficient(metric, n, cfg.min_test_samples),
    };
    if n < cfg.min_test_samples {
        return insufficient(0, 0);
    }

    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(cfg.cluster_seed);
    idx.shuffle(&mut rng);
    let holdout_n = ((n as f64) * cfg.holdout_fraction).round() as usize;
    let holdout_n = holdout_n.clamp(1, n - 1);
    let (holdout, train) = idx.split_at(holdout_n);

    let x_train: Vec<Vec<f64>> = train.iter().map(|&i| blunder_features(rows[i])).collect();
    let y_train: Vec<bool> = train.iter().map(|&i| rows[i].is_severe()).collect();
    let Some(model) = stats::logistic_fit(&x_train, &y_train, cfg.logistic_max_iters) else {
        return insufficient(train.len(), holdout.len());
    };

    let scores: Vec<f64> = holdout.iter().map(|&i| model.predict(&blunder_features(rows[i]))).collect();
    let labels: Vec<bool> = holdout.iter().map(|&i| rows[i].is_severe()).collect();
    let result = match stats::roc_auc(&scores, &labels) {
        Some(auc) => TestResult::computed(metric, holdout.len(), auc, None),
        None => TestResult::insufficient(metric, holdout.len(), cfg.min_test_samples),
    };
    debug!(train = train.len(), holdout = holdout.len(), converged = model.converged, "blunder model fitted");

    BlunderModelReport {
        features,
        model: Some(model),
        train_size: train.len(),
        holdout_size: holdout.len(),
        result,
    }
}

// ---------------------------------------------------------------------
//  Latency vs outcome
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyGapReport {
    pub severe_mean: Option<f64>,
    pub other_mean: Option<f64>,
    pub cohens_d: Option<f64>,
    pub result: TestResult,
}

/// Welch t-test of normalized latency, severe versus non-severe outcomes.
pub fn blunder_latency_ttest(
    records: &[FrictionRecord],
    filter: PressureFilter,
    cfg: &EngineConfig,
) -> LatencyGapReport {
    let (severe, other): (Vec<&FrictionRecord>, Vec<&FrictionRecord>) = evaluated(records)
        .filter(|r| filter.admits(r))
        .partition(|r| r.is_severe());
    let a: Vec<f64> = severe.iter().map(|r| r.normalized_latency).collect();
    let b: Vec<f64> = other.iter().map(|r| r.normalized_latency).collect();
    let n = a.len() + b.len();
    let metric = format!("blunder_latency.welch_t.{}", filter.label());

    let test = if a.len() < 2 || b.len() < 2 || n < cfg.min_test_samples {
        None
    } else {
        stats::welch_t(&a, &b)
    };
    let result = match &test {
        Some(t) => TestResult::computed(metric, n, t.t, Some(t.p_value)),
        None => TestResult::insufficient(metric, n, cfg.min_test_samples),
    };
    LatencyGapReport {
        severe_mean: stats::mean(&a),
        other_mean: stats::mean(&b),
        cohens_d: test.map(|t| t.cohens_d),
        result,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRow {
    pub label: String,
    pub n: usize,
    pub severe: usize,
    pub rate: Option<f64>,
}

fn rate_rows<K: Ord>(rows: impl Iterator<Item = (K, bool)>, label: impl Fn(&K) -> String) -> Vec<RateRow> {
    let mut acc: BTreeMap<K, (usize, usize)> = BTreeMap::new();
    for (k, severe) in rows {
        let e = acc.entry(k).or_default();
        e.0 += 1;
        if severe {
            e.1 += 1;
        }
    }
    acc.into_iter()
        .map(|(k, (n, severe))| RateRow {
            label: label(&k),
            n,
            severe,
            rate: (n > 0).then(|| severe as f64 / n as f64),
        })
        .collect()
}

pub fn severe_rate_by_friction_level(records: &[FrictionRecord]) -> Vec<RateRow> {
    rate_rows(evaluated(records).map(|r| (r.friction_level, r.is_severe())), |l| {
        let name = match l {
            FrictionLevel::Low => "low",
            FrictionLevel::Normal => "normal",
            FrictionLevel::High => "high",
        };
        name.to_string()
    })
}

pub fn severe_rate_by_stage(records: &[FrictionRecord]) -> Vec<RateRow> {
    rate_rows(evaluated(records).map(|r| (r.stage, r.is_severe())), |s| s.as_str().to_string())
}

pub fn severe_rate_by_skill_band(records: &[FrictionRecord], cfg: &EngineConfig) -> Vec<RateRow> {
    let edges = &cfg.skill_bands;
    rate_rows(
        evaluated(records).filter_map(|r| {
            let b = band_index(r.skill?, edges)?;
            Some((b, r.is_severe()))
        }),
        |b| match edges.get(b + 1) {
            Some(upper) => format!("{}-{}", edges[*b], upper),
            None => format!("{}+", edges[*b]),
        },
    )
}

// ---------------------------------------------------------------------
//  Suite
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub complexity: Vec<ComplexityReport>,
    pub skill_bands: SkillBandReport,
    pub advantage_trap: ContingencyReport,
    pub context_shift_trap: ContingencyReport,
    pub friction_gap: ContingencyReport,
    pub bad_firmware: BadFirmwareReport,
    pub ceiling_floor: CeilingReport,
    pub blunder_model: BlunderModelReport,
    pub blunder_latency: Vec<LatencyGapReport>,
    pub rate_by_level: Vec<RateRow>,
    pub rate_by_stage: Vec<RateRow>,
    pub rate_by_skill: Vec<RateRow>,
}

impl AnalysisReport {
    /// Flat rows for the results table.
    pub fn results(&self) -> Vec<TestResult> {
        let mut out = Vec::new();
        for c in &self.complexity {
            out.extend(c.quartiles.iter().map(|q| q.result.clone()));
        }
        out.push(self.skill_bands.trend.clone());
        out.push(self.skill_bands.error_trend.clone());
        out.push(self.advantage_trap.result.clone());
        out.push(self.context_shift_trap.result.clone());
        out.push(self.friction_gap.result.clone());
        out.push(self.bad_firmware.result.clone());
        out.push(self.ceiling_floor.result.clone());
        out.push(self.blunder_model.result.clone());
        out.extend(self.blunder_latency.iter().map(|l| l.result.clone()));
        out
    }
}

/// Run every named test once. Both time-pressure subsets are reported next
/// to the pooled numbers.
pub fn run_suite(records: &[FrictionRecord], profiles: &[FirmwareProfile], cfg: &EngineConfig) -> AnalysisReport {
    let filters = [PressureFilter::All, PressureFilter::Unpressured, PressureFilter::Pressured];
    let mut complexity = Vec::new();
    for proxy in [ComplexityProxy::Score, ComplexityProxy::NearOptimal] {
        for filter in filters {
            complexity.push(complexity_latency_error(records, proxy, filter, cfg));
        }
    }
    AnalysisReport {
        complexity,
        skill_bands: coverage_by_skill_band(profiles, cfg),
        advantage_trap: advantage_trap(records, cfg),
        context_shift_trap: context_shift_trap(records, cfg),
        friction_gap: friction_gap_contingency(records, cfg),
        bad_firmware: bad_firmware(records, cfg),
        ceiling_floor: ceiling_floor(profiles, cfg),
        blunder_model: blunder_prediction(records, cfg),
        blunder_latency: filters
            .iter()
            .map(|f| blunder_latency_ttest(records, *f, cfg))
            .collect(),
        rate_by_level: severe_rate_by_friction_level(records),
        rate_by_stage: severe_rate_by_stage(records),
        rate_by_skill: severe_rate_by_skill_band(records, cfg),
    }
}
