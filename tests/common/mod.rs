#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use friction_engine::cluster::{ClusterId, ClusterRef, EpochId};
use friction_engine::config::EngineConfig;
use friction_engine::features::Stage;
use friction_engine::friction::{Band, FrictionLevel, FrictionRecord, Severity};

/// A bare record: evaluated, untimed, no triggers.
pub fn record(actor: &str, epoch: u32, cluster: u32, period: usize, normalized: f64, severe: bool) -> FrictionRecord {
    let cfg = EngineConfig::default();
    let band = Band::classify(normalized, &cfg);
    let severity = if severe { Severity::Severe } else { Severity::None };
    FrictionRecord {
        actor_id: actor.to_string(),
        situation_id: format!("{actor}/{epoch}/{cluster}/{period}/{normalized}"),
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::days(period as i64),
        cluster: ClusterRef {
            epoch: EpochId(epoch),
            cluster: ClusterId(cluster),
        },
        period,
        latency_secs: normalized * 10.0,
        normalized_latency: normalized,
        baseline_mean: Some(10.0),
        baseline_version: 1,
        band,
        friction_level: FrictionLevel::from(band),
        error_magnitude: Some(if severe { 300.0 } else { 0.0 }),
        severity: Some(severity),
        triggers: None,
        should_fire: false,
        fired: band == Band::System2,
        hit: false,
        miss: false,
        false_alarm: false,
        failure: None,
        complexity: 0.5,
        stage: Stage::Middle,
        near_optimal: None,
        chosen_rank: None,
        friction_gap: false,
        time_pressure: false,
        forced: false,
        skill: Some(1800.0),
    }
}

/// `n` identical records in one cluster.
pub fn block(actor: &str, epoch: u32, cluster: u32, period: usize, normalized: f64, n: usize) -> Vec<FrictionRecord> {
    (0..n)
        .map(|i| {
            let mut r = record(actor, epoch, cluster, period, normalized, false);
            r.situation_id = format!("{}#{i}", r.situation_id);
            r
        })
        .collect()
}

/// Config with floors small enough for hand-built fixtures.
pub fn small_floors() -> EngineConfig {
    EngineConfig {
        min_actor_cluster_samples: 5,
        min_test_samples: 10,
        min_actors_per_band: 1,
        ..EngineConfig::default()
    }
}
