//! Decision events: the normalized input schema.
//!
//! Domain collaborators (clock parsers, Q&A log extractors, buzzer logs) map
//! their native records into [`DecisionEvent`]. Events are immutable once
//! built; [`validate_events`] drops malformed ones with a logged reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::features::SituationFeatures;

/// Rank of the external actor's preceding action in its own expected list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rank", rename_all = "snake_case")]
pub enum ExternalRank {
    /// 1-based position among the expected actions.
    Ranked(usize),
    /// Not among the expected actions at all.
    Unranked,
}

/// Quality-scored alternatives available at the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeRanking {
    /// Quality of each candidate response, best first.
    pub qualities: Vec<f64>,
    /// Value of the situation before the decision, from the actor's side.
    pub situation_value: f64,
    /// 1-based rank of the response the actor chose, if it was ranked.
    #[serde(default)]
    pub chosen_rank: Option<usize>,
    /// How expected the preceding external action was. `None` when there was
    /// no preceding external action.
    #[serde(default)]
    pub preceding_external: Option<ExternalRank>,
}

impl AlternativeRanking {
    /// Alternatives (other than the best) within `margin` of the best.
    pub fn near_optimal_count(&self, margin: f64) -> usize {
        match self.qualities.first() {
            Some(&best) => self
                .qualities
                .iter()
                .skip(1)
                .filter(|&&q| (best - q).abs() <= margin)
                .count(),
            None => 0,
        }
    }

    /// Gap between the best and the second best alternative.
    pub fn criticality_gap(&self) -> Option<f64> {
        match self.qualities.as_slice() {
            [best, second, ..] => Some((best - second).abs()),
            _ => None,
        }
    }
}

/// Whether a decision carries a ranked list of alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankContext {
    #[default]
    WithoutAlternatives,
    WithAlternatives(AlternativeRanking),
}

impl RankContext {
    pub fn ranking(&self) -> Option<&AlternativeRanking> {
        match self {
            RankContext::WithoutAlternatives => None,
            RankContext::WithAlternatives(r) => Some(r),
        }
    }
}

/// Time-pressure state, supplied explicitly by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimePressure {
    /// No clock applies to this decision.
    Untimed,
    /// A clock applies; `remaining_secs` is the budget left at decision time.
    Timed { remaining_secs: f64 },
}

impl TimePressure {
    pub fn is_acute(&self, floor_secs: f64) -> bool {
        match self {
            TimePressure::Untimed => false,
            TimePressure::Timed { remaining_secs } => *remaining_secs < floor_secs,
        }
    }
}

/// One observed decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub actor_id: String,
    pub situation_id: String,
    pub features: SituationFeatures,
    pub timestamp: DateTime<Utc>,
    pub latency_secs: f64,
    /// Graded error magnitude of the response. `None` until evaluated.
    #[serde(default)]
    pub outcome: Option<f64>,
    /// Declared skill or rating at decision time.
    #[serde(default)]
    pub skill: Option<f64>,
    #[serde(default)]
    pub rank_context: RankContext,
    pub time_pressure: TimePressure,
    /// Number of legal/available options. `Some(1)` marks a forced decision.
    #[serde(default)]
    pub option_count: Option<u32>,
    /// Identifier of the chosen response (move, answer id).
    #[serde(default)]
    pub response_id: Option<String>,
}

impl DecisionEvent {
    pub fn is_forced(&self) -> bool {
        self.option_count == Some(1)
    }
}

/// Why an event was dropped during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    EmptyActor,
    EmptySituation,
    NonFiniteLatency,
    NegativeLatency,
    InvalidOutcome,
    InvalidRemainingBudget,
    InvalidRanking,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DropReport {
    pub accepted: usize,
    pub dropped: Vec<(usize, DropReason)>,
}

pub fn check_event(event: &DecisionEvent) -> Result<(), DropReason> {
    if event.actor_id.trim().is_empty() {
        return Err(DropReason::EmptyActor);
    }
    if event.situation_id.trim().is_empty() {
        return Err(DropReason::EmptySituation);
    }
    if !event.latency_secs.is_finite() {
        return Err(DropReason::NonFiniteLatency);
    }
    if event.latency_secs < 0.0 {
        return Err(DropReason::NegativeLatency);
    }
    if let Some(o) = event.outcome {
        if !o.is_finite() || o < 0.0 {
            return Err(DropReason::InvalidOutcome);
        }
    }
    if let TimePressure::Timed { remaining_secs } = event.time_pressure {
        if !remaining_secs.is_finite() {
            return Err(DropReason::InvalidRemainingBudget);
        }
    }
    if let Some(r) = event.rank_context.ranking() {
        let finite = r.qualities.iter().all(|q| q.is_finite()) && r.situation_value.is_finite();
        let ordered = r.qualities.windows(2).all(|w| w[0] >= w[1]);
        if !finite || !ordered || r.qualities.is_empty() {
            return Err(DropReason::InvalidRanking);
        }
    }
    Ok(())
}

/// Split events into valid ones and a drop report. Never coerces a bad value.
pub fn validate_events(events: Vec<DecisionEvent>) -> (Vec<DecisionEvent>, DropReport) {
    let mut report = DropReport::default();
    let mut kept = Vec::with_capacity(events.len());
    for (idx, event) in events.into_iter().enumerate() {
        match check_event(&event) {
            Ok(()) => kept.push(event),
            Err(reason) => {
                warn!(
                    index = idx,
                    actor = %event.actor_id,
                    situation = %event.situation_id,
                    ?reason,
                    "dropping malformed decision event"
                );
                report.dropped.push((idx, reason));
            }
        }
    }
    report.accepted = kept.len();
    (kept, report)
}
