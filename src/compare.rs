//! Comparative engine: where two matched actors' firmware diverges.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::{ClusterId, EpochId};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::profile::FirmwareProfile;

/// What the two actors were matched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchBasis {
    /// Same skill band, given by its lower edge.
    SkillBand { lower: f64 },
    Age { years: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A is markedly faster here: A has firmware B lacks.
    AHasFirmware,
    BHasFirmware,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::AHasFirmware => Direction::BHasFirmware,
            Direction::BHasFirmware => Direction::AHasFirmware,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDivergence {
    pub cluster: ClusterId,
    pub mean_a: f64,
    pub mean_b: f64,
    /// `mean_b - mean_a`.
    pub difference: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub actor_a: String,
    pub actor_b: String,
    pub epoch: EpochId,
    pub basis: MatchBasis,
    pub shared_clusters: usize,
    pub divergent: Vec<ClusterDivergence>,
}

fn check_basis(a: &FirmwareProfile, b: &FirmwareProfile, basis: &MatchBasis, cfg: &EngineConfig) {
    let MatchBasis::SkillBand { lower } = basis else {
        return;
    };
    let upper = cfg
        .skill_bands
        .iter()
        .copied()
        .find(|e| e > lower)
        .unwrap_or(f64::INFINITY);
    for p in [a, b] {
        if let Some(s) = p.mean_skill {
            if s < *lower || s >= upper {
                warn!(actor = %p.actor_id, skill = s, lower, "actor outside the declared skill band");
            }
        }
    }
}

/// Compare two profiles of the same epoch over their shared sufficient
/// clusters. Swapping `a` and `b` flips every direction and nothing else.
pub fn compare(
    a: &FirmwareProfile,
    b: &FirmwareProfile,
    basis: MatchBasis,
    cfg: &EngineConfig,
) -> EngineResult<Comparison> {
    if a.epoch != b.epoch {
        return Err(EngineError::EpochPair {
            left: a.epoch,
            right: b.epoch,
        });
    }
    check_basis(a, b, &basis, cfg);

    let mut shared_clusters = 0;
    let mut divergent = Vec::new();
    for ca in &a.clusters {
        let Some(mean_a) = ca.mean() else { continue };
        let Some(mean_b) = b.cluster(ca.cluster.cluster).and_then(|c| c.mean()) else {
            continue;
        };
        shared_clusters += 1;
        let difference = mean_b - mean_a;
        if difference.abs() > cfg.divergence_threshold {
            divergent.push(ClusterDivergence {
                cluster: ca.cluster.cluster,
                mean_a,
                mean_b,
                difference,
                direction: if difference > 0.0 {
                    Direction::AHasFirmware
                } else {
                    Direction::BHasFirmware
                },
            });
        }
    }
    divergent.sort_by_key(|d| d.cluster);

    Ok(Comparison {
        actor_a: a.actor_id.clone(),
        actor_b: b.actor_id.clone(),
        epoch: a.epoch,
        basis,
        shared_clusters,
        divergent,
    })
}
