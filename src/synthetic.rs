//! Deterministic synthetic decision streams.
//!
//! Used by the `synth` subcommand and by tests. Each actor masters a subset of
//! situation structures (more of them with higher skill) and answers those
//! fast. Severe outcomes get more likely when an actor answers an unfamiliar,
//! complex situation either too fast or after a long struggle.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::event::{AlternativeRanking, DecisionEvent, ExternalRank, RankContext, TimePressure};
use crate::features::{complexity_score, extract, FeatureScales, SituationFeatures};

const STRUCTURES: u64 = 16;

#[derive(Debug, Clone, Serialize)]
pub struct SyntheticCase {
    pub name: &'static str,
    pub actors: usize,
    pub events_per_actor: usize,
    /// Share of events that carry ranked alternatives.
    pub ranked_share: f64,
    /// Clock budget per actor in seconds; `None` for untimed streams.
    pub clock_secs: Option<f64>,
    pub seed: u64,
}

pub fn synthetic_cases() -> Vec<SyntheticCase> {
    vec![
        SyntheticCase {
            name: "small_untimed",
            actors: 4,
            events_per_actor: 120,
            ranked_share: 1.0,
            clock_secs: None,
            seed: 42,
        },
        SyntheticCase {
            name: "club_timed",
            actors: 12,
            events_per_actor: 240,
            ranked_share: 0.9,
            clock_secs: Some(5400.0),
            seed: 43,
        },
        SyntheticCase {
            name: "blitz_pressure",
            actors: 8,
            events_per_actor: 200,
            ranked_share: 0.8,
            clock_secs: Some(900.0),
            seed: 44,
        },
    ]
}

pub fn find_case(name: &str) -> Option<SyntheticCase> {
    synthetic_cases().into_iter().find(|c| c.name == name)
}

fn sample_normal(rng: &mut impl Rng, mean: f64, std: f64) -> f64 {
    if std <= 0.0 {
        return mean;
    }
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen::<f64>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + z0 * std
}

fn start_instant() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default()
}

/// Generate the event stream of a case. Same case, same events.
pub fn generate(case: &SyntheticCase) -> Vec<DecisionEvent> {
    let mut rng = StdRng::seed_from_u64(case.seed);
    let scales = FeatureScales::default();
    let start = start_instant();
    let mut events = Vec::with_capacity(case.actors * case.events_per_actor);

    for a in 0..case.actors {
        let actor_id = format!("actor_{a:03}");
        let skill = 1000.0 + 1500.0 * rng.gen::<f64>();
        let mastered = ((skill - 1000.0) / 1500.0 * STRUCTURES as f64).round() as u64;
        let base_latency = rng.gen_range(6.0..18.0);
        let mut remaining = case.clock_secs;
        let n = case.events_per_actor.max(1);

        for i in 0..case.events_per_actor {
            let progress = i as f64 / n as f64;
            let features = SituationFeatures {
                phase: (1.0 - progress + sample_normal(&mut rng, 0.0, 0.05)).clamp(0.0, 1.0),
                balance: sample_normal(&mut rng, 0.0, 250.0),
                structure_hash: rng.gen_range(0..STRUCTURES),
                activity: rng.gen_range(0.0..8.0),
                mobility: rng.gen_range(5.0..45.0),
                tension: rng.gen_range(0.0..4.0),
                ambiguity: rng.gen::<f64>(),
            };
            let complexity = complexity_score(&extract(&features, &scales));
            let familiar = features.structure_hash < mastered;

            let mut latency = if familiar {
                base_latency * rng.gen_range(0.25..0.6)
            } else {
                base_latency * rng.gen_range(0.7..2.6) * (1.0 + complexity)
            };

            let time_pressure = match remaining.as_mut() {
                Some(left) => {
                    latency = latency.min((*left * 0.2).max(0.2));
                    let state = TimePressure::Timed {
                        remaining_secs: *left,
                    };
                    *left = (*left - latency).max(0.0);
                    state
                }
                None => TimePressure::Untimed,
            };

            let slow = latency / base_latency;
            let mut severe_p = 0.03;
            if !familiar {
                severe_p += 0.25 * complexity * slow.min(3.0) / 3.0;
                if slow < 0.7 {
                    severe_p += 0.15;
                }
            }
            let severe = rng.gen::<f64>() < severe_p;
            let outcome = if severe {
                rng.gen_range(100.0..400.0)
            } else {
                rng.gen_range(0.0..90.0)
            };

            let forced = rng.gen::<f64>() < 0.02;
            let rank_context = if rng.gen::<f64>() < case.ranked_share {
                let alts = rng.gen_range(2..7usize);
                let mut qualities = Vec::with_capacity(alts);
                let mut q = features.balance;
                for _ in 0..alts {
                    qualities.push(q);
                    q -= rng.gen_range(0.0..160.0);
                }
                let preceding_external = if rng.gen::<f64>() < 0.1 {
                    Some(ExternalRank::Unranked)
                } else {
                    Some(ExternalRank::Ranked(rng.gen_range(1..10)))
                };
                RankContext::WithAlternatives(AlternativeRanking {
                    qualities,
                    situation_value: features.balance,
                    chosen_rank: Some(if severe { rng.gen_range(2..=alts) } else { 1 }),
                    preceding_external,
                })
            } else {
                RankContext::WithoutAlternatives
            };
            let chosen = rank_context
                .ranking()
                .and_then(|r| r.chosen_rank)
                .unwrap_or(1);

            events.push(DecisionEvent {
                actor_id: actor_id.clone(),
                situation_id: format!("{actor_id}/{i:05}"),
                features,
                timestamp: start + Duration::seconds((a * 7 + i * 90) as i64),
                latency_secs: latency,
                outcome: Some(outcome),
                skill: Some(skill),
                rank_context,
                time_pressure,
                option_count: Some(if forced { 1 } else { rng.gen_range(2..40) }),
                response_id: Some(format!("r{chosen}")),
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let case = find_case("small_untimed").unwrap();
        assert_eq!(generate(&case), generate(&case));
        assert_eq!(generate(&case).len(), 480);
    }

    #[test]
    fn timed_cases_carry_a_clock() {
        let case = find_case("blitz_pressure").unwrap();
        let events = generate(&case);
        assert!(events
            .iter()
            .all(|e| matches!(e.time_pressure, TimePressure::Timed { .. })));
    }
}
