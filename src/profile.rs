//! Profile aggregation: friction records → per-actor firmware profiles.
//!
//! Records are partitioned by (actor, epoch, period) and, inside each
//! partition, by cluster. Aggregates below their sample floor are carried as
//! [`Aggregate::Insufficient`] so that every record stays accounted for.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analysis::stats;
use crate::cluster::{ClusterId, ClusterRef, EpochId};
use crate::config::EngineConfig;
use crate::features::Stage;
use crate::friction::{Band, FrictionRecord, Severity};

/// An aggregate that may be below its sample floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Aggregate<T> {
    Sufficient(T),
    Insufficient { n: usize, floor: usize },
}

impl<T> Aggregate<T> {
    pub fn sufficient(&self) -> Option<&T> {
        match self {
            Aggregate::Sufficient(v) => Some(v),
            Aggregate::Insufficient { .. } => None,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        matches!(self, Aggregate::Sufficient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub mean: f64,
    pub median: f64,
    pub variance: f64,
    /// Share of evaluated records with a severe outcome. `None` if none were
    /// evaluated.
    pub severe_rate: Option<f64>,
    pub mean_severity_weight: f64,
    pub evaluated: usize,
    pub band: Band,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorClusterProfile {
    pub cluster: ClusterRef,
    pub n: usize,
    pub stats: Aggregate<ClusterStats>,
}

impl ActorClusterProfile {
    pub fn band(&self) -> Option<Band> {
        self.stats.sufficient().map(|s| s.band)
    }

    pub fn mean(&self) -> Option<f64> {
        self.stats.sufficient().map(|s| s.mean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Population-weighted share of sufficient clusters that are firmware.
    pub coverage: f64,
    pub surface_area: f64,
    /// Non-firmware share weighted by `1 + mean severity weight`, in `[0, 2]`.
    pub friction_surface: f64,
    pub firmware_accuracy: Option<f64>,
    pub non_firmware_accuracy: Option<f64>,
    pub firmware_clusters: usize,
    pub sufficient_clusters: usize,
}

/// Reading of an actor's stage ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthOutlook {
    /// Sandwich with a strong middle-stage slowdown.
    HighPotential,
    /// Sandwich with a weak slowdown.
    ModeratePotential,
    /// Slows down in the middle stage without the fast early stage.
    Developing,
    PlateauRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempoStyle {
    SpeedFirst,
    Balanced,
    Deliberate,
}

/// Median latency of each stage relative to the actor's overall median.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSignature {
    pub early_ratio: f64,
    pub middle_ratio: f64,
    /// Falls back to 1.0 when the late stage was never reached.
    pub late_ratio: f64,
    /// Middle-stage median over early-stage median.
    pub trigger_ratio: f64,
    /// Fast early stage, slow middle stage.
    pub sandwich: bool,
    pub outlook: GrowthOutlook,
    pub style: TempoStyle,
}

impl StageSignature {
    /// `None` unless both the early and the middle stage were observed.
    pub fn from_samples(samples: &[(f64, Stage)], cfg: &EngineConfig) -> Option<Self> {
        let stage_median = |stage: Stage| {
            let xs: Vec<f64> = samples.iter().filter(|(_, s)| *s == stage).map(|(l, _)| *l).collect();
            stats::median(&xs)
        };
        let all: Vec<f64> = samples.iter().map(|(l, _)| *l).collect();
        let median = stats::median(&all).filter(|m| *m > 0.0)?;
        let early = stage_median(Stage::Early)?;
        let middle = stage_median(Stage::Middle)?;
        let late = stage_median(Stage::Late).unwrap_or(median);

        let early_ratio = early / median;
        let middle_ratio = middle / median;
        let trigger_ratio = if early > 0.0 { middle / early } else { 0.0 };
        let sandwich = early_ratio < 1.0 && middle_ratio > 1.0;

        let outlook = match (sandwich, trigger_ratio) {
            (true, r) if r >= cfg.strong_trigger_ratio => GrowthOutlook::HighPotential,
            (true, _) => GrowthOutlook::ModeratePotential,
            (false, r) if r > 1.0 => GrowthOutlook::Developing,
            (false, _) => GrowthOutlook::PlateauRisk,
        };
        let style = if trigger_ratio >= cfg.speed_style_ratio {
            TempoStyle::SpeedFirst
        } else if trigger_ratio >= cfg.balanced_style_ratio {
            TempoStyle::Balanced
        } else {
            TempoStyle::Deliberate
        };

        Some(Self {
            early_ratio,
            middle_ratio,
            late_ratio: late / median,
            trigger_ratio,
            sandwich,
            outlook,
            style,
        })
    }
}

/// Distribution of raw latency for one actor-period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySignature {
    pub n: usize,
    pub p10: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub p90: f64,
    /// p90 / p10. `None` when p10 is zero.
    pub bimodal_index: Option<f64>,
    pub coefficient_of_variation: Option<f64>,
    pub stages: Option<StageSignature>,
}

impl LatencySignature {
    pub fn from_samples(samples: &[(f64, Stage)], cfg: &EngineConfig) -> Option<Self> {
        if samples.len() < 2 {
            return None;
        }
        let latencies: Vec<f64> = samples.iter().map(|(l, _)| *l).collect();
        let s = stats::sorted(&latencies);
        let p10 = stats::quantile(&s, 0.10)?;
        let p90 = stats::quantile(&s, 0.90)?;
        let mean = stats::mean(&s)?;
        let sd = stats::variance(&s)?.sqrt();
        Some(Self {
            n: s.len(),
            p10,
            p25: stats::quantile(&s, 0.25)?,
            median: stats::quantile(&s, 0.5)?,
            p75: stats::quantile(&s, 0.75)?,
            p90,
            bimodal_index: (p10 > 0.0).then(|| p90 / p10),
            coefficient_of_variation: (mean > 0.0).then(|| sd / mean),
            stages: StageSignature::from_samples(samples, cfg),
        })
    }
}

/// Profile of one actor in one (epoch, period) partition. A period cut by an
/// epoch boundary yields one profile per epoch; see [`latest_profile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareProfile {
    pub actor_id: String,
    pub epoch: EpochId,
    pub period: usize,
    pub clusters: Vec<ActorClusterProfile>,
    /// `Insufficient` when no cluster reaches the sample floor.
    pub coverage: Aggregate<Coverage>,
    pub records_total: usize,
    pub records_sufficient: usize,
    pub records_insufficient: usize,
    pub mean_skill: Option<f64>,
    pub latency: Option<LatencySignature>,
}

impl FirmwareProfile {
    pub fn cluster(&self, id: ClusterId) -> Option<&ActorClusterProfile> {
        self.clusters.iter().find(|c| c.cluster.cluster == id)
    }

    pub fn coverage_value(&self) -> Option<f64> {
        self.coverage.sufficient().map(|c| c.coverage)
    }
}

/// Band of a cluster from its mean normalized latency and severe rate.
/// An unevaluated cluster is judged on latency alone.
pub fn classify_cluster(mean: f64, severe_rate: Option<f64>, cfg: &EngineConfig) -> Band {
    let accurate = severe_rate.map_or(true, |r| r < cfg.firmware_error_ceiling);
    if mean < cfg.firmware_cutoff && accurate {
        Band::Firmware
    } else if mean > cfg.system2_cutoff {
        Band::System2
    } else {
        Band::Mixed
    }
}

fn cluster_profile(cluster: ClusterRef, records: &[&FrictionRecord], cfg: &EngineConfig) -> ActorClusterProfile {
    let n = records.len();
    let floor = cfg.min_actor_cluster_samples;
    if n < floor {
        return ActorClusterProfile {
            cluster,
            n,
            stats: Aggregate::Insufficient { n, floor },
        };
    }
    let latencies: Vec<f64> = records.iter().map(|r| r.normalized_latency).collect();
    let severities: Vec<Severity> = records.iter().filter_map(|r| r.severity).collect();
    let evaluated = severities.len();
    let severe = severities.iter().filter(|s| **s == Severity::Severe).count();
    let severe_rate = (evaluated > 0).then(|| severe as f64 / evaluated as f64);
    let mean_severity_weight = if evaluated > 0 {
        severities.iter().map(Severity::weight).sum::<f64>() / evaluated as f64
    } else {
        0.0
    };
    let mean = stats::mean(&latencies).unwrap_or(1.0);

    ActorClusterProfile {
        cluster,
        n,
        stats: Aggregate::Sufficient(ClusterStats {
            mean,
            median: stats::median(&latencies).unwrap_or(mean),
            variance: stats::variance(&latencies).unwrap_or(0.0),
            severe_rate,
            mean_severity_weight,
            evaluated,
            band: classify_cluster(mean, severe_rate, cfg),
        }),
    }
}

fn accuracy(records: &[&FrictionRecord]) -> Option<f64> {
    let evaluated: Vec<_> = records.iter().filter_map(|r| r.severity).collect();
    if evaluated.is_empty() {
        return None;
    }
    let ok = evaluated.iter().filter(|s| **s != Severity::Severe).count();
    Some(ok as f64 / evaluated.len() as f64)
}

fn build_profile(
    actor_id: &str,
    epoch: EpochId,
    period: usize,
    records: &[&FrictionRecord],
    cfg: &EngineConfig,
) -> FirmwareProfile {
    let mut by_cluster: BTreeMap<ClusterId, Vec<&FrictionRecord>> = BTreeMap::new();
    for r in records {
        by_cluster.entry(r.cluster.cluster).or_default().push(*r);
    }

    let clusters: Vec<ActorClusterProfile> = by_cluster
        .iter()
        .map(|(&cluster, rs)| cluster_profile(ClusterRef { epoch, cluster }, rs, cfg))
        .collect();

    let records_sufficient: usize = clusters.iter().filter(|c| c.stats.is_sufficient()).map(|c| c.n).sum();
    let records_total = records.len();

    let coverage = if records_sufficient == 0 {
        Aggregate::Insufficient {
            n: records_total,
            floor: cfg.min_actor_cluster_samples,
        }
    } else {
        let mut firmware_n = 0usize;
        let mut weighted_friction = 0.0;
        let mut fw_records = Vec::new();
        let mut other_records = Vec::new();
        let mut firmware_clusters = 0;
        for c in &clusters {
            let Some(s) = c.stats.sufficient() else { continue };
            let members = &by_cluster[&c.cluster.cluster];
            match s.band {
                Band::Firmware => {
                    firmware_n += c.n;
                    firmware_clusters += 1;
                    fw_records.extend(members.iter().copied());
                }
                Band::Mixed | Band::System2 => {
                    weighted_friction += c.n as f64 * (1.0 + s.mean_severity_weight);
                    other_records.extend(members.iter().copied());
                }
            }
        }
        let coverage = firmware_n as f64 / records_sufficient as f64;
        Aggregate::Sufficient(Coverage {
            coverage,
            surface_area: 1.0 - coverage,
            friction_surface: weighted_friction / records_sufficient as f64,
            firmware_accuracy: accuracy(&fw_records),
            non_firmware_accuracy: accuracy(&other_records),
            firmware_clusters,
            sufficient_clusters: clusters.iter().filter(|c| c.stats.is_sufficient()).count(),
        })
    };

    let skills: Vec<f64> = records.iter().filter_map(|r| r.skill).collect();
    let samples: Vec<(f64, Stage)> = records.iter().map(|r| (r.latency_secs, r.stage)).collect();

    FirmwareProfile {
        actor_id: actor_id.to_string(),
        epoch,
        period,
        clusters,
        coverage,
        records_total,
        records_sufficient,
        records_insufficient: records_total - records_sufficient,
        mean_skill: stats::mean(&skills),
        latency: LatencySignature::from_samples(&samples, cfg),
    }
}

/// Build one profile per (actor, epoch, period) present in `records`.
/// Output is sorted by that key.
pub fn aggregate(records: &[FrictionRecord], cfg: &EngineConfig) -> Vec<FirmwareProfile> {
    let mut partitions: BTreeMap<(&str, EpochId, usize), Vec<&FrictionRecord>> = BTreeMap::new();
    for r in records {
        partitions
            .entry((r.actor_id.as_str(), r.cluster.epoch, r.period))
            .or_default()
            .push(r);
    }
    partitions
        .into_par_iter()
        .map(|((actor, epoch, period), rs)| build_profile(actor, epoch, period, &rs, cfg))
        .collect()
}

/// Latest-epoch profile of `actor` in `period`. Profiles of the same period
/// from earlier epochs are skipped with a warning.
pub fn latest_profile<'a>(profiles: &'a [FirmwareProfile], actor: &str, period: usize) -> Option<&'a FirmwareProfile> {
    let candidates: Vec<&FirmwareProfile> = profiles
        .iter()
        .filter(|p| p.actor_id == actor && p.period == period)
        .collect();
    let latest = candidates.iter().copied().max_by_key(|p| p.epoch)?;
    for skipped in candidates.iter().filter(|p| p.epoch != latest.epoch) {
        warn!(
            actor,
            period,
            skipped_epoch = skipped.epoch.0,
            used_epoch = latest.epoch.0,
            records = skipped.records_total,
            "period spans an epoch boundary; using the latest epoch only"
        );
    }
    Some(latest)
}
