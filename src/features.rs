//! Feature extraction: situation snapshot → fixed-order feature vector.
//!
//! Every component is mapped into `[0, 1]` with domain-fixed caps (never
//! min-max over the data) so that vectors from different batches stay
//! comparable and no raw-scale feature dominates the clustering distance.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Number of components in a [`FeatureVector`].
pub const FEATURE_DIM: usize = 7;

/// Buckets the structural hash is folded into.
const STRUCTURE_BUCKETS: u64 = 64;

/// Domain-specific situation descriptors supplied by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SituationFeatures {
    /// Phase indicator: 1.0 = opening/start, 0.0 = endgame/finish.
    pub phase: f64,
    /// Material or score balance from the actor's side.
    pub balance: f64,
    /// Structural fingerprint (pawn skeleton, question category, ...).
    #[serde(default)]
    pub structure_hash: u64,
    /// Forcing-move or action count (captures, checks, buzz cues).
    pub activity: f64,
    /// Legal move or option count.
    pub mobility: f64,
    /// Tension indicators (mutually attacking pawns, open threats).
    pub tension: f64,
    /// Ambiguity indicator (competing plausible answers).
    #[serde(default)]
    pub ambiguity: f64,
}

/// Caps used to normalize raw counts. Values at or above a cap map to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureScales {
    pub balance_cap: f64,
    pub activity_cap: f64,
    pub mobility_cap: f64,
    pub tension_cap: f64,
    pub ambiguity_cap: f64,
    /// Weight of the structural bucket; lower values let it break ties only.
    pub structure_weight: f64,
}

impl Default for FeatureScales {
    fn default() -> Self {
        Self {
            balance_cap: 900.0,
            activity_cap: 10.0,
            mobility_cap: 40.0,
            tension_cap: 4.0,
            ambiguity_cap: 1.0,
            structure_weight: 0.25,
        }
    }
}

impl FeatureScales {
    pub fn validate(&self) -> EngineResult<()> {
        let caps = [
            self.balance_cap,
            self.activity_cap,
            self.mobility_cap,
            self.tension_cap,
            self.ambiguity_cap,
        ];
        if caps.iter().any(|c| !(c.is_finite() && *c > 0.0)) {
            return Err(EngineError::InvalidConfig(
                "feature caps must be positive finite numbers".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.structure_weight) {
            return Err(EngineError::InvalidConfig(
                "structure_weight must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalized, fixed-order feature vector:
/// `[phase, balance, activity, mobility, tension, ambiguity, structure]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_DIM]);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn distance_sq(&self, other: &FeatureVector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    pub fn phase(&self) -> f64 {
        self.0[0]
    }
}

fn capped(value: f64, cap: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value / cap).min(1.0)
}

/// Extract the feature vector. Pure: same input, same output.
pub fn extract(features: &SituationFeatures, scales: &FeatureScales) -> FeatureVector {
    let phase = if features.phase.is_finite() {
        features.phase.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let balance = if features.balance.is_finite() {
        let b = features.balance.clamp(-scales.balance_cap, scales.balance_cap);
        0.5 + 0.5 * b / scales.balance_cap
    } else {
        0.5
    };
    let structure = (features.structure_hash % STRUCTURE_BUCKETS) as f64
        / STRUCTURE_BUCKETS as f64
        * scales.structure_weight;

    FeatureVector([
        phase,
        balance,
        capped(features.activity, scales.activity_cap),
        capped(features.mobility, scales.mobility_cap),
        capped(features.tension, scales.tension_cap),
        capped(features.ambiguity, scales.ambiguity_cap),
        structure,
    ])
}

/// Coarse stage of a decision sequence, read off the phase component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Early,
    Middle,
    Late,
}

impl Stage {
    /// Phase above `early_cutoff` is early, at or below `late_cutoff` is late.
    pub fn of(phase: f64, early_cutoff: f64, late_cutoff: f64) -> Stage {
        if phase > early_cutoff {
            Stage::Early
        } else if phase <= late_cutoff {
            Stage::Late
        } else {
            Stage::Middle
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Early => "early",
            Stage::Middle => "middle",
            Stage::Late => "late",
        }
    }
}

/// Situation complexity in `[0, 1]`. Middle phases weigh most.
pub fn complexity_score(v: &FeatureVector) -> f64 {
    let [phase, _balance, activity, mobility, tension, ambiguity, _structure] = v.0;
    let blend = 0.4 * mobility + 0.3 * activity + 0.2 * ambiguity + 0.1 * tension;
    let phase_multiplier = 1.0 - (phase - 0.6).abs() * 0.5;
    (blend * phase_multiplier).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SituationFeatures {
        SituationFeatures {
            phase: 0.6,
            balance: 300.0,
            structure_hash: 130,
            activity: 5.0,
            mobility: 80.0,
            tension: 2.0,
            ambiguity: 0.5,
        }
    }

    #[test]
    fn components_stay_in_unit_range() {
        let v = extract(&sample(), &FeatureScales::default());
        assert!(v.0.iter().all(|c| (0.0..=1.0).contains(c)));
        // mobility above cap saturates
        assert_eq!(v.0[3], 1.0);
        assert!((v.0[1] - (0.5 + 0.5 * 300.0 / 900.0)).abs() < 1e-12);
    }

    #[test]
    fn complexity_peaks_in_middle_phase() {
        let scales = FeatureScales::default();
        let mid = complexity_score(&extract(&sample(), &scales));
        let mut late = sample();
        late.phase = 0.0;
        let late = complexity_score(&extract(&late, &scales));
        assert!(mid > late);
    }

    #[test]
    fn stage_edges_follow_the_cutoffs() {
        assert_eq!(Stage::of(0.9, 0.7, 0.3), Stage::Early);
        assert_eq!(Stage::of(0.7, 0.7, 0.3), Stage::Middle);
        assert_eq!(Stage::of(0.31, 0.7, 0.3), Stage::Middle);
        assert_eq!(Stage::of(0.3, 0.7, 0.3), Stage::Late);
    }
}
