mod common;

use common::{block, record, small_floors};
use chrono::Duration;
use friction_engine::analysis::stats::Contingency;
use friction_engine::analysis::{
    advantage_trap, bad_firmware, blunder_latency_ttest, blunder_prediction, ceiling_floor,
    complexity_latency_error, context_shift_trap, coverage_by_skill_band, friction_gap_contingency, run_suite,
    severe_rate_by_friction_level, severe_rate_by_stage, ComplexityProxy, PressureFilter,
};
use friction_engine::config::EngineConfig;
use friction_engine::features::Stage;
use friction_engine::friction::{FrictionRecord, TriggerMetrics};
use friction_engine::profile::aggregate;
use friction_engine::ClusterId;

/// Top-quartile complexity records carry an injected latency/severity link;
/// the rest do not.
fn injected_complexity_fixture() -> Vec<FrictionRecord> {
    (0..200)
        .map(|i| {
            let latency = 0.3 + (i % 10) as f64 * 0.25;
            let severe = if i >= 150 { i % 10 >= 6 } else { i % 7 == 0 };
            let mut r = record("alice", 0, (i % 4) as u32, 0, latency, severe);
            r.situation_id = format!("s{i}");
            r.complexity = i as f64 / 200.0;
            r
        })
        .collect()
}

#[test]
fn top_complexity_quartile_recovers_the_injected_correlation() {
    let cfg = small_floors();
    let report = complexity_latency_error(
        &injected_complexity_fixture(),
        ComplexityProxy::Score,
        PressureFilter::All,
        &cfg,
    );
    assert_eq!(report.quartiles.len(), 4);
    let q4 = &report.quartiles[3];
    assert_eq!(q4.quartile, 4);
    assert_eq!(q4.result.sample_size, 50);
    assert_eq!(q4.lower, Some(0.75));
    assert_eq!(q4.result.metric, "complexity_latency_error.score.all.q4");
    assert!(q4.result.statistic().unwrap() > 0.5);
    assert!(q4.result.p_value().unwrap() < 0.01);
}

#[test]
fn small_quartiles_are_reported_insufficient() {
    let cfg = EngineConfig::default();
    let records: Vec<FrictionRecord> = injected_complexity_fixture().into_iter().take(40).collect();
    let report = complexity_latency_error(&records, ComplexityProxy::Score, PressureFilter::All, &cfg);
    assert!(report.quartiles.iter().all(|q| q.result.is_insufficient()));
    assert!(report.quartiles.iter().all(|q| q.result.statistic().is_none()));
}

#[test]
fn near_optimal_proxy_skips_records_without_rankings() {
    let cfg = small_floors();
    let report = complexity_latency_error(
        &injected_complexity_fixture(),
        ComplexityProxy::NearOptimal,
        PressureFilter::All,
        &cfg,
    );
    assert!(report.quartiles.iter().all(|q| q.result.sample_size == 0));
}

#[test]
fn pressure_filters_split_the_records() {
    let cfg = small_floors();
    let mut records = injected_complexity_fixture();
    for r in records.iter_mut().step_by(2) {
        r.time_pressure = true;
    }
    let pressured = blunder_latency_ttest(&records, PressureFilter::Pressured, &cfg);
    let calm = blunder_latency_ttest(&records, PressureFilter::Unpressured, &cfg);
    let all = blunder_latency_ttest(&records, PressureFilter::All, &cfg);
    assert_eq!(pressured.result.sample_size + calm.result.sample_size, all.result.sample_size);
    assert_eq!(all.result.metric, "blunder_latency.welch_t.all");
}

#[test]
fn blunder_model_ranks_held_out_records() {
    let cfg = small_floors();
    let records: Vec<FrictionRecord> = (0..300)
        .map(|i| {
            let latency = 0.3 + (i % 20) as f64 * 0.1;
            let mut severe = latency > 1.6;
            if i % 13 == 0 {
                severe = !severe;
            }
            let mut r = record("bob", 0, 0, 0, latency, severe);
            r.situation_id = format!("s{i}");
            r.complexity = (i % 7) as f64 / 7.0;
            r
        })
        .collect();

    let report = blunder_prediction(&records, &cfg);
    assert_eq!(report.train_size + report.holdout_size, 300);
    assert_eq!(report.holdout_size, 90);
    let auc = report.result.statistic().unwrap();
    assert!(auc > 0.75, "auc {auc}");
    let signs = report.coefficient_signs();
    assert_eq!(signs[0], ("normalized_latency".to_string(), 1.0));

    // Same records, same split, same model.
    assert_eq!(blunder_prediction(&records, &cfg), report);
}

#[test]
fn fast_and_wrong_clusters_are_flagged() {
    let cfg = small_floors();
    let mut records = block("carol", 0, 1, 0, 0.4, 4);
    for i in 0..6 {
        let mut r = record("carol", 0, 0, 0, 0.3, i < 4);
        r.situation_id = format!("bad{i}");
        records.push(r);
    }
    let report = bad_firmware(&records, &cfg);
    assert_eq!(report.flagged.len(), 1);
    assert_eq!(report.flagged[0].cluster.cluster, ClusterId(0));
    assert!((report.flagged[0].error_rate - 4.0 / 6.0).abs() < 1e-12);
}

#[test]
fn expert_cohort_exposes_ceilings_and_floors() {
    let cfg = EngineConfig {
        min_actors_per_band: 3,
        ..small_floors()
    };
    let mut records = Vec::new();
    for actor in ["e1", "e2", "e3"] {
        records.extend(block(actor, 0, 0, 0, 2.2, 6));
        records.extend(block(actor, 0, 1, 0, 0.3, 6));
    }
    for r in records.iter_mut() {
        r.skill = Some(2400.0);
    }
    records.extend(block("novice", 0, 0, 0, 0.3, 6));

    let profiles = aggregate(&records, &cfg);
    let report = ceiling_floor(&profiles, &cfg);
    assert_eq!(report.cohort, vec!["e1", "e2", "e3"]);
    assert_eq!(report.ceilings.len(), 1);
    assert_eq!(report.ceilings[0].cluster, ClusterId(0));
    assert_eq!(report.floors.len(), 1);
    assert_eq!(report.floors[0].cluster, ClusterId(1));
}

#[test]
fn coverage_rises_with_skill_band() {
    let cfg = small_floors();
    let mut records = Vec::new();
    for (i, skill) in [1100.0, 1300.0, 1500.0, 1700.0].into_iter().enumerate() {
        let actor = format!("a{i}");
        for cluster in 0..4u32 {
            let fast = (cluster as usize) <= i;
            let mut rs = block(&actor, 0, cluster, 0, if fast { 0.4 } else { 2.0 }, 5);
            for r in rs.iter_mut() {
                r.skill = Some(skill);
            }
            records.extend(rs);
        }
    }
    let profiles = aggregate(&records, &cfg);
    let report = coverage_by_skill_band(&profiles, &cfg);
    let covered: Vec<f64> = report.bands.iter().filter_map(|b| b.mean_coverage).collect();
    assert_eq!(covered, vec![0.25, 0.5, 0.75, 1.0]);
    assert!(report.deviations.is_empty());
    assert!((report.trend.statistic().unwrap() - 1.0).abs() < 1e-12);
}

#[test]
fn friction_gap_table_only_counts_ranked_records() {
    let cfg = small_floors();
    let mut records = injected_complexity_fixture();
    for (i, r) in records.iter_mut().enumerate().take(60) {
        r.near_optimal = Some(2);
        r.friction_gap = i % 2 == 0;
    }
    let report = friction_gap_contingency(&records, &cfg);
    assert_eq!(report.table.total(), 60);
    assert!(!report.result.is_insufficient());
}

#[test]
fn suite_reports_every_test_by_name() {
    let cfg = small_floors();
    let records = injected_complexity_fixture();
    let profiles = aggregate(&records, &cfg);
    let report = run_suite(&records, &profiles, &cfg);
    let results = report.results();
    // 2 proxies x 3 filters x 4 quartiles, 8 single tests, 3 latency gaps.
    assert_eq!(results.len(), 24 + 8 + 3);
    let mut names: Vec<&str> = results.iter().map(|r| r.metric.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), results.len());

    let levels = severe_rate_by_friction_level(&records);
    let n: usize = levels.iter().map(|l| l.n).sum();
    assert_eq!(n, records.len());
}

/// A record whose situation value moved by `swing` since the prior decision.
fn swung(actor: &str, i: usize, normalized: f64, severe: bool, swing: f64) -> FrictionRecord {
    let mut r = record(actor, 0, 0, 0, normalized, severe);
    r.situation_id = format!("{actor}/swing{i}");
    r.triggers = Some(TriggerMetrics {
        near_optimal: 0,
        optionality_delta: None,
        criticality_gap: None,
        evaluation_gradient: Some(swing),
        environment_surprise: false,
        trigger_score: 0.0,
    });
    r
}

#[test]
fn advantage_trap_ignores_slow_errors() {
    let cfg = small_floors();
    let mut records = Vec::new();
    for i in 0..20 {
        records.push(swung("ann", i, 2.0, true, 150.0));
        records.push(swung("ann", 20 + i, 0.4, false, 150.0));
    }
    for i in 0..20 {
        records.push(swung("ann", 40 + i, 0.4, i < 4, 10.0));
    }

    let report = advantage_trap(&records, &cfg);
    assert_eq!(
        report.table,
        Contingency {
            exposed_event: 0,
            exposed_none: 40,
            unexposed_event: 4,
            unexposed_none: 16,
        }
    );
    assert_eq!(report.relative_risk, Some(0.0));
}

#[test]
fn advantage_trap_raises_the_fast_error_rate() {
    let cfg = small_floors();
    let mut records = Vec::new();
    for i in 0..20 {
        records.push(swung("ann", i, 0.4, i < 10, 150.0));
    }
    for i in 0..40 {
        records.push(swung("ann", 20 + i, 0.4, i < 4, -20.0));
    }
    // records without a prior value stay out of the table
    records.push(record("ann", 0, 0, 0, 0.4, true));

    let report = advantage_trap(&records, &cfg);
    assert_eq!(report.table.total(), 60);
    assert_eq!(report.table.exposed_event, 10);
    assert_eq!(report.table.unexposed_event, 4);
    assert!((report.relative_risk.unwrap() - 5.0).abs() < 1e-9);
    assert!(!report.result.is_insufficient());
    assert!(report.result.p_value().unwrap() < 0.01);
}

fn sequence(actor: &str, clusters: impl Iterator<Item = (u32, bool)>) -> Vec<FrictionRecord> {
    clusters
        .enumerate()
        .map(|(i, (cluster, severe))| {
            let mut r = record(actor, 0, cluster, 0, 2.0, severe);
            r.situation_id = format!("{actor}/seq{i}");
            r.timestamp += Duration::minutes(i as i64);
            r
        })
        .collect()
}

#[test]
fn every_cluster_change_counts_as_a_shift() {
    let cfg = small_floors();
    let records = sequence("ben", (0..40).map(|i| ((i % 2) as u32, true)));
    let report = context_shift_trap(&records, &cfg);
    assert_eq!(
        report.table,
        Contingency {
            exposed_event: 39,
            exposed_none: 0,
            unexposed_event: 0,
            unexposed_none: 0,
        }
    );
}

#[test]
fn context_shift_trap_compares_shifts_with_stays() {
    let cfg = small_floors();
    // Pairs 0,0,1,1,0,0,...: a shift at every even index after the first.
    let records = sequence(
        "ben",
        (0..40).map(|i| {
            let shifted = i > 0 && i % 2 == 0;
            (((i / 2) % 2) as u32, shifted || i % 10 == 1)
        }),
    );
    let report = context_shift_trap(&records, &cfg);
    assert_eq!(
        report.table,
        Contingency {
            exposed_event: 19,
            exposed_none: 0,
            unexposed_event: 4,
            unexposed_none: 16,
        }
    );
    assert!((report.relative_risk.unwrap() - 5.0).abs() < 1e-9);
}

#[test]
fn bad_firmware_below_the_observation_floor_is_insufficient() {
    let cfg = small_floors();
    let empty = bad_firmware(&[], &cfg);
    assert!(empty.result.is_insufficient());
    assert_eq!(empty.result.sample_size, 0);

    let few: Vec<FrictionRecord> = (0..3)
        .map(|i| {
            let mut r = record("cat", 0, 0, 0, 0.3, true);
            r.situation_id = format!("few{i}");
            r
        })
        .collect();
    let report = bad_firmware(&few, &cfg);
    assert!(report.flagged.is_empty());
    assert!(report.result.is_insufficient());
}

#[test]
fn ceiling_without_a_shared_cluster_is_insufficient() {
    let cfg = EngineConfig {
        min_actors_per_band: 3,
        ..small_floors()
    };
    let mut records = Vec::new();
    for (cluster, actor) in ["e1", "e2", "e3"].into_iter().enumerate() {
        records.extend(block(actor, 0, cluster as u32, 0, 0.3, 6));
    }
    for r in records.iter_mut() {
        r.skill = Some(2400.0);
    }
    let profiles = aggregate(&records, &cfg);
    let report = ceiling_floor(&profiles, &cfg);
    assert_eq!(report.cohort.len(), 3);
    assert!(report.ceilings.is_empty() && report.floors.is_empty());
    assert!(report.result.is_insufficient());
}

/// Four actors, one per skill band. Each has a firmware cluster of 40
/// records with the given number of severe outcomes, plus a slow cluster.
fn firmware_error_fixture(severe_counts: [usize; 4]) -> Vec<FrictionRecord> {
    let mut records = Vec::new();
    for (i, (skill, severe)) in [1100.0, 1300.0, 1500.0, 1700.0]
        .into_iter()
        .zip(severe_counts)
        .enumerate()
    {
        let actor = format!("p{i}");
        let mut rows: Vec<FrictionRecord> = (0..40)
            .map(|j| {
                let mut r = record(&actor, 0, 0, 0, 0.4, j < severe);
                r.situation_id = format!("{actor}/fw{j}");
                r
            })
            .collect();
        rows.extend(block(&actor, 0, 1, 0, 2.0, 40));
        for r in rows.iter_mut() {
            r.skill = Some(skill);
        }
        records.extend(rows);
    }
    records
}

#[test]
fn firmware_error_rate_falls_with_skill_band() {
    let cfg = small_floors();
    let profiles = aggregate(&firmware_error_fixture([3, 2, 1, 0]), &cfg);
    let report = coverage_by_skill_band(&profiles, &cfg);

    let rates: Vec<f64> = report.bands.iter().filter_map(|b| b.mean_firmware_error_rate).collect();
    assert_eq!(rates.len(), 4);
    for (got, want) in rates.iter().zip([0.075, 0.05, 0.025, 0.0]) {
        assert!((got - want).abs() < 1e-9, "{got} vs {want}");
    }
    assert!(report.error_deviations.is_empty());
    assert!((report.error_trend.statistic().unwrap() + 1.0).abs() < 1e-12);
    assert_eq!(report.error_trend.metric, "coverage_by_skill_band.firmware_error_spearman");
}

#[test]
fn firmware_error_rate_rising_in_a_band_is_a_deviation() {
    let cfg = small_floors();
    let profiles = aggregate(&firmware_error_fixture([3, 2, 3, 0]), &cfg);
    let report = coverage_by_skill_band(&profiles, &cfg);
    assert_eq!(report.error_deviations, vec![2]);

    let sparse = EngineConfig {
        min_actors_per_band: 2,
        ..small_floors()
    };
    let report = coverage_by_skill_band(&profiles, &sparse);
    assert!(report.bands.iter().all(|b| b.mean_firmware_error_rate.is_none()));
    assert!(report.error_trend.is_insufficient());
}

#[test]
fn severe_rate_is_tabled_by_stage() {
    let mut records = Vec::new();
    for (i, stage) in [Stage::Early, Stage::Middle, Stage::Late].into_iter().enumerate() {
        for j in 0..10 {
            let mut r = record("dan", 0, 0, 0, 1.0, j < i + 1);
            r.situation_id = format!("stage{i}/{j}");
            r.stage = stage;
            records.push(r);
        }
    }
    let rows = severe_rate_by_stage(&records);
    let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["early", "middle", "late"]);
    assert_eq!(rows.iter().map(|r| r.severe).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(rows[2].rate, Some(0.3));
}
