//! Trigger metrics: signals that a decision deserved deliberation.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::event::{AlternativeRanking, ExternalRank};

/// What the actor's previous decision left behind for the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorContext {
    pub near_optimal: Option<usize>,
    pub situation_value: Option<f64>,
}

impl PriorContext {
    pub fn from_ranking(ranking: Option<&AlternativeRanking>, cfg: &EngineConfig) -> Self {
        match ranking {
            Some(r) => Self {
                near_optimal: Some(r.near_optimal_count(cfg.near_optimal_margin)),
                situation_value: Some(r.situation_value),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetrics {
    pub near_optimal: usize,
    /// Relative change of the near-optimal count versus the prior event.
    pub optionality_delta: Option<f64>,
    /// Best minus second-best quality.
    pub criticality_gap: Option<f64>,
    /// Signed swing of situation value since the prior event.
    pub evaluation_gradient: Option<f64>,
    pub environment_surprise: bool,
    /// Mean of the capped individual signals, in `[0, 1]`.
    pub trigger_score: f64,
}

impl TriggerMetrics {
    pub fn should_fire(&self, cfg: &EngineConfig) -> bool {
        let critical = self
            .criticality_gap
            .is_some_and(|g| g >= cfg.criticality_gap_threshold);
        let shrinking = self
            .optionality_delta
            .is_some_and(|d| d <= cfg.optionality_shrink_threshold);
        critical || shrinking
    }
}

pub fn compute(ranking: &AlternativeRanking, prior: &PriorContext, cfg: &EngineConfig) -> TriggerMetrics {
    let near_optimal = ranking.near_optimal_count(cfg.near_optimal_margin);
    let optionality_delta = prior
        .near_optimal
        .map(|prev| (near_optimal as f64 - prev as f64) / prev.max(1) as f64);
    let criticality_gap = ranking.criticality_gap();
    let evaluation_gradient = prior.situation_value.map(|prev| ranking.situation_value - prev);
    let environment_surprise = match ranking.preceding_external {
        Some(ExternalRank::Unranked) => true,
        Some(ExternalRank::Ranked(r)) => r > cfg.surprise_top_k,
        None => false,
    };

    let mut signals = Vec::with_capacity(4);
    if let Some(d) = optionality_delta {
        signals.push(d.abs().min(1.0));
    }
    if let Some(g) = evaluation_gradient {
        signals.push((g.abs() / cfg.gradient_signal_cap).min(1.0));
    }
    if let Some(g) = criticality_gap {
        signals.push((g / cfg.criticality_signal_cap).min(1.0));
    }
    if environment_surprise {
        signals.push(1.0);
    }
    let trigger_score = if signals.is_empty() {
        0.0
    } else {
        signals.iter().sum::<f64>() / signals.len() as f64
    };

    TriggerMetrics {
        near_optimal,
        optionality_delta,
        criticality_gap,
        evaluation_gradient,
        environment_surprise,
        trigger_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(q: Vec<f64>, value: f64, ext: Option<ExternalRank>) -> AlternativeRanking {
        AlternativeRanking {
            qualities: q,
            situation_value: value,
            chosen_rank: None,
            preceding_external: ext,
        }
    }

    #[test]
    fn shrinking_optionality_is_relative() {
        let cfg = EngineConfig::default();
        let prior = PriorContext {
            near_optimal: Some(5),
            situation_value: Some(20.0),
        };
        let r = ranking(vec![100.0, 90.0, 80.0, 0.0], 70.0, None);
        let t = compute(&r, &prior, &cfg);
        assert_eq!(t.near_optimal, 2);
        assert!((t.optionality_delta.unwrap() + 0.6).abs() < 1e-12);
        assert_eq!(t.evaluation_gradient, Some(50.0));
        assert!(t.should_fire(&cfg));
    }

    #[test]
    fn surprise_counts_unranked_and_deep_ranks() {
        let cfg = EngineConfig::default();
        let prior = PriorContext::default();
        let deep = compute(&ranking(vec![1.0], 0.0, Some(ExternalRank::Ranked(9))), &prior, &cfg);
        let shallow = compute(&ranking(vec![1.0], 0.0, Some(ExternalRank::Ranked(2))), &prior, &cfg);
        let unranked = compute(&ranking(vec![1.0], 0.0, Some(ExternalRank::Unranked)), &prior, &cfg);
        assert!(deep.environment_surprise);
        assert!(!shallow.environment_surprise);
        assert!(unranked.environment_surprise);
        assert!(!shallow.should_fire(&cfg));
    }
}
