//! Growth tracking: an actor's profiles over successive periods.
//!
//! Profiles built in different epochs are aligned into one target epoch
//! through migration maps before any comparison. A missing map or an
//! unmapped cluster is an [`EngineError::EpochMismatch`] and aborts the
//! trajectory.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::stats;
use crate::cluster::{ClusterId, ClusterRef, EpochId, MigrationMap};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::friction::Band;
use crate::profile::{classify_cluster, FirmwareProfile};

/// One sufficient cluster after alignment into the target epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedCluster {
    pub cluster: ClusterId,
    pub n: usize,
    pub mean: f64,
    pub band: Band,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthPoint {
    pub period: usize,
    pub source_epochs: Vec<EpochId>,
    /// `None` when no cluster of the period was sufficient.
    pub coverage: Option<f64>,
    pub clusters: Vec<AlignedCluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GrowthSlope {
    Estimated { slope: f64, points: usize },
    Insufficient { points: usize, floor: usize },
}

/// A cluster changing category between two consecutive observed periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandTransition {
    pub cluster: ClusterId,
    pub from_period: usize,
    pub to_period: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthTrajectory {
    pub actor_id: String,
    pub target_epoch: EpochId,
    pub points: Vec<GrowthPoint>,
    pub slope: GrowthSlope,
    /// System-2 in one period, firmware in the next.
    pub gained: Vec<BandTransition>,
    /// Firmware in one period, System-2 in the next.
    pub lost: Vec<BandTransition>,
}

impl GrowthTrajectory {
    pub fn coverage_series(&self) -> Vec<(usize, f64)> {
        self.points
            .iter()
            .filter_map(|p| p.coverage.map(|c| (p.period, c)))
            .collect()
    }

    /// Distinct clusters with at least one gain.
    pub fn gained_clusters(&self) -> Vec<ClusterId> {
        distinct(&self.gained)
    }

    pub fn lost_clusters(&self) -> Vec<ClusterId> {
        distinct(&self.lost)
    }
}

fn distinct(transitions: &[BandTransition]) -> Vec<ClusterId> {
    let set: BTreeSet<ClusterId> = transitions.iter().map(|t| t.cluster).collect();
    set.into_iter().collect()
}

/// Maps from source epochs into `target`, keyed by source epoch.
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    target: Option<EpochId>,
    maps: BTreeMap<EpochId, MigrationMap>,
}

impl Alignment {
    pub fn new(target: EpochId) -> Self {
        Self {
            target: Some(target),
            maps: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> Option<EpochId> {
        self.target
    }

    /// Register a map. It must land in the target epoch.
    pub fn insert(&mut self, map: MigrationMap) -> EngineResult<()> {
        if let Some(target) = self.target {
            if map.to != target {
                return Err(EngineError::EpochPair {
                    left: map.to,
                    right: target,
                });
            }
        }
        self.maps.insert(map.from, map);
        Ok(())
    }

    fn resolve(&self, r: ClusterRef, target: EpochId) -> EngineResult<ClusterRef> {
        if r.epoch == target {
            return Ok(r);
        }
        match self.maps.get(&r.epoch) {
            Some(map) => map.resolve(r),
            None => Err(EngineError::EpochMismatch {
                cluster: r.cluster,
                from: r.epoch,
                to: target,
            }),
        }
    }
}

#[derive(Default)]
struct Pool {
    n: usize,
    latency_sum: f64,
    severe_sum: f64,
    evaluated: usize,
}

fn align_period(
    profiles: &[&FirmwareProfile],
    alignment: &Alignment,
    target: EpochId,
    cfg: &EngineConfig,
) -> EngineResult<Vec<AlignedCluster>> {
    let mut pools: BTreeMap<ClusterId, Pool> = BTreeMap::new();
    for p in profiles {
        for c in &p.clusters {
            let aligned = alignment.resolve(c.cluster, target)?;
            let Some(s) = c.stats.sufficient() else { continue };
            let pool = pools.entry(aligned.cluster).or_default();
            pool.n += c.n;
            pool.latency_sum += s.mean * c.n as f64;
            if let Some(rate) = s.severe_rate {
                pool.severe_sum += rate * s.evaluated as f64;
                pool.evaluated += s.evaluated;
            }
        }
    }
    Ok(pools
        .into_iter()
        .map(|(cluster, pool)| {
            let mean = pool.latency_sum / pool.n as f64;
            let severe_rate = (pool.evaluated > 0).then(|| pool.severe_sum / pool.evaluated as f64);
            AlignedCluster {
                cluster,
                n: pool.n,
                mean,
                band: classify_cluster(mean, severe_rate, cfg),
            }
        })
        .collect())
}

/// Build the trajectory of one actor. `profiles` may arrive in any order and
/// may include several epochs; profiles of other actors are ignored.
pub fn track(
    actor_id: &str,
    profiles: &[FirmwareProfile],
    alignment: &Alignment,
    cfg: &EngineConfig,
) -> EngineResult<GrowthTrajectory> {
    let mut by_period: BTreeMap<usize, Vec<&FirmwareProfile>> = BTreeMap::new();
    for p in profiles.iter().filter(|p| p.actor_id == actor_id) {
        by_period.entry(p.period).or_default().push(p);
    }

    let target = match alignment.target() {
        Some(t) => t,
        None => by_period
            .values()
            .flatten()
            .map(|p| p.epoch)
            .max()
            .unwrap_or(EpochId(0)),
    };

    let mut points = Vec::with_capacity(by_period.len());
    for (period, ps) in &by_period {
        let clusters = align_period(ps, alignment, target, cfg)?;
        let total: usize = clusters.iter().map(|c| c.n).sum();
        let firmware: usize = clusters
            .iter()
            .filter(|c| c.band == Band::Firmware)
            .map(|c| c.n)
            .sum();
        let source_epochs: BTreeSet<EpochId> = ps.iter().map(|p| p.epoch).collect();
        points.push(GrowthPoint {
            period: *period,
            source_epochs: source_epochs.into_iter().collect(),
            coverage: (total > 0).then(|| firmware as f64 / total as f64),
            clusters,
        });
    }

    let series: Vec<(f64, f64)> = points
        .iter()
        .filter_map(|p| p.coverage.map(|c| (p.period as f64, c)))
        .collect();
    let slope = if series.len() < cfg.min_growth_periods {
        GrowthSlope::Insufficient {
            points: series.len(),
            floor: cfg.min_growth_periods,
        }
    } else {
        let (x, y): (Vec<f64>, Vec<f64>) = series.iter().copied().unzip();
        match stats::linear_slope(&x, &y) {
            Some(slope) => GrowthSlope::Estimated {
                slope,
                points: series.len(),
            },
            None => GrowthSlope::Insufficient {
                points: series.len(),
                floor: cfg.min_growth_periods,
            },
        }
    };

    // Transitions between each pair of consecutive points.
    let mut gained = Vec::new();
    let mut lost = Vec::new();
    for pair in points.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        for c in &after.clusters {
            let Some(prev) = before.clusters.iter().find(|p| p.cluster == c.cluster) else {
                continue;
            };
            let transition = BandTransition {
                cluster: c.cluster,
                from_period: before.period,
                to_period: after.period,
            };
            match (prev.band, c.band) {
                (Band::System2, Band::Firmware) => gained.push(transition),
                (Band::Firmware, Band::System2) => lost.push(transition),
                _ => {}
            }
        }
    }

    for t in &lost {
        warn!(
            actor = actor_id,
            cluster = t.cluster.0,
            from_period = t.from_period,
            to_period = t.to_period,
            "cluster regressed from firmware to system-2"
        );
    }
    debug!(actor = actor_id, points = points.len(), gained = gained.len(), "growth trajectory built");

    Ok(GrowthTrajectory {
        actor_id: actor_id.to_string(),
        target_epoch: target,
        points,
        slope,
        gained,
        lost,
    })
}
