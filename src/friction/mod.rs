//! Friction classifier.
//!
//! Turns one event plus the actor's baseline snapshot into a
//! [`FrictionRecord`]. Classification is a pure function of its inputs;
//! [`prepare_contexts`] is the single ordered pass that produces those inputs.

pub mod baseline;
pub mod triggers;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterRef;
use crate::config::EngineConfig;
use crate::event::DecisionEvent;
use crate::features::{complexity_score, FeatureVector, Stage};

pub use baseline::{is_baseline_eligible, ActorBaseline, BaselineSnapshot};
pub use triggers::{PriorContext, TriggerMetrics};

/// Latency band. Every normalized latency falls in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Firmware,
    Mixed,
    System2,
}

impl Band {
    pub fn classify(normalized: f64, cfg: &EngineConfig) -> Band {
        if normalized < cfg.firmware_cutoff {
            Band::Firmware
        } else if normalized > cfg.system2_cutoff {
            Band::System2
        } else {
            Band::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Firmware => "firmware",
            Band::Mixed => "mixed",
            Band::System2 => "system2",
        }
    }
}

/// Tag used in the record table. Mirrors the band cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrictionLevel {
    Low,
    Normal,
    High,
}

impl From<Band> for FrictionLevel {
    fn from(band: Band) -> Self {
        match band {
            Band::Firmware => FrictionLevel::Low,
            Band::Mixed => FrictionLevel::Normal,
            Band::System2 => FrictionLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    pub fn from_magnitude(magnitude: f64, cfg: &EngineConfig) -> Severity {
        if magnitude >= cfg.severe_threshold {
            Severity::Severe
        } else if magnitude >= cfg.moderate_threshold {
            Severity::Moderate
        } else if magnitude >= cfg.minor_threshold {
            Severity::Minor
        } else {
            Severity::None
        }
    }

    /// Weight used by the friction surface.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::None => 0.0,
            Severity::Minor => 0.25,
            Severity::Moderate => 0.5,
            Severity::Severe => 1.0,
        }
    }
}

/// Diagnosis of a severe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Fast response in a complex situation.
    FirmwareMisfire,
    /// Fast response in a simple situation.
    PatternSlip,
    /// Slow, deliberate, and still wrong.
    System2Failure,
    Indeterminate,
}

/// Everything the classifier needs besides the event itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub baseline: BaselineSnapshot,
    pub prior: PriorContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrictionRecord {
    pub actor_id: String,
    pub situation_id: String,
    pub timestamp: DateTime<Utc>,
    pub cluster: ClusterRef,
    pub period: usize,
    pub latency_secs: f64,
    pub normalized_latency: f64,
    pub baseline_mean: Option<f64>,
    pub baseline_version: u64,
    pub band: Band,
    pub friction_level: FrictionLevel,
    pub error_magnitude: Option<f64>,
    /// `None` when no outcome was available.
    pub severity: Option<Severity>,
    pub triggers: Option<TriggerMetrics>,
    pub should_fire: bool,
    pub fired: bool,
    pub hit: bool,
    pub miss: bool,
    pub false_alarm: bool,
    pub failure: Option<FailureType>,
    pub complexity: f64,
    pub stage: Stage,
    pub near_optimal: Option<usize>,
    pub chosen_rank: Option<usize>,
    /// Near-optimal alternatives existed but the actor did not slow down.
    pub friction_gap: bool,
    pub time_pressure: bool,
    pub forced: bool,
    pub skill: Option<f64>,
}

impl FrictionRecord {
    pub fn is_severe(&self) -> bool {
        self.severity == Some(Severity::Severe)
    }
}

/// Inputs for one classification.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub event: &'a DecisionEvent,
    pub vector: &'a FeatureVector,
    pub cluster: ClusterRef,
    pub period: usize,
    pub context: EventContext,
}

// ---------------------------------------------------------------------
//  Ordered per-actor pass
// ---------------------------------------------------------------------

/// Walk every actor's events in time order and capture the baseline snapshot
/// and prior-event context each event sees. The result is aligned with
/// `events`.
///
/// Actors are independent, so they run in parallel; within an actor the
/// order is (timestamp, input index).
pub fn prepare_contexts(events: &[DecisionEvent], cfg: &EngineConfig) -> Vec<EventContext> {
    let mut by_actor: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, e) in events.iter().enumerate() {
        by_actor.entry(e.actor_id.as_str()).or_default().push(idx);
    }

    let per_actor: Vec<Vec<(usize, EventContext)>> = by_actor
        .into_par_iter()
        .map(|(_, mut indices)| {
            indices.sort_by_key(|&i| (events[i].timestamp, i));
            let mut acc = ActorBaseline::new(cfg);
            let mut prior = PriorContext::default();
            let mut out = Vec::with_capacity(indices.len());
            for i in indices {
                let e = &events[i];
                out.push((
                    i,
                    EventContext {
                        baseline: acc.snapshot(),
                        prior,
                    },
                ));
                if is_baseline_eligible(e, cfg) {
                    acc.observe(e.latency_secs);
                }
                prior = PriorContext::from_ranking(e.rank_context.ranking(), cfg);
            }
            out
        })
        .collect();

    let mut contexts = vec![
        EventContext {
            baseline: ActorBaseline::new(cfg).snapshot(),
            prior: PriorContext::default(),
        };
        events.len()
    ];
    for (i, ctx) in per_actor.into_iter().flatten() {
        contexts[i] = ctx;
    }
    contexts
}

// ---------------------------------------------------------------------
//  Classification
// ---------------------------------------------------------------------

pub fn classify_event(input: &ClassifierInput<'_>, cfg: &EngineConfig) -> FrictionRecord {
    let event = input.event;
    let baseline = input.context.baseline;
    let normalized = baseline.normalize(event.latency_secs);
    let band = Band::classify(normalized, cfg);
    let severity = event.outcome.map(|m| Severity::from_magnitude(m, cfg));
    let severe = severity == Some(Severity::Severe);
    let complexity = complexity_score(input.vector);

    let ranking = event.rank_context.ranking();
    let triggers = ranking.map(|r| triggers::compute(r, &input.context.prior, cfg));
    let should_fire = triggers.as_ref().is_some_and(|t| t.should_fire(cfg));
    let fired = band == Band::System2;
    let not_severe = matches!(severity, Some(s) if s != Severity::Severe);

    let failure = severe.then(|| match band {
        Band::Firmware if complexity >= cfg.high_complexity_threshold => FailureType::FirmwareMisfire,
        Band::Firmware => FailureType::PatternSlip,
        Band::System2 => FailureType::System2Failure,
        Band::Mixed => FailureType::Indeterminate,
    });

    let near_optimal = triggers.as_ref().map(|t| t.near_optimal);

    FrictionRecord {
        actor_id: event.actor_id.clone(),
        situation_id: event.situation_id.clone(),
        timestamp: event.timestamp,
        cluster: input.cluster,
        period: input.period,
        latency_secs: event.latency_secs,
        normalized_latency: normalized,
        baseline_mean: baseline.mean,
        baseline_version: baseline.version,
        band,
        friction_level: band.into(),
        error_magnitude: event.outcome,
        severity,
        triggers,
        should_fire,
        fired,
        hit: should_fire && fired,
        miss: should_fire && !fired && severe,
        false_alarm: !should_fire && fired && not_severe,
        failure,
        complexity,
        stage: Stage::of(input.vector.phase(), cfg.early_stage_cutoff, cfg.late_stage_cutoff),
        near_optimal,
        chosen_rank: ranking.and_then(|r| r.chosen_rank),
        friction_gap: near_optimal.is_some_and(|n| n > 0) && normalized <= 1.0,
        time_pressure: event.time_pressure.is_acute(cfg.time_pressure_floor_secs),
        forced: event.is_forced(),
        skill: event.skill,
    }
}

/// Classify a batch in parallel. Output order matches input order.
pub fn classify_batch(inputs: &[ClassifierInput<'_>], cfg: &EngineConfig) -> Vec<FrictionRecord> {
    inputs.par_iter().map(|i| classify_event(i, cfg)).collect()
}
