mod common;

use common::{block, record, small_floors};
use friction_engine::config::EngineConfig;
use friction_engine::friction::{Band, FrictionRecord};
use friction_engine::profile::{aggregate, Aggregate};
use friction_engine::ClusterId;

fn mixed_actor() -> Vec<FrictionRecord> {
    let mut records = block("alice", 0, 0, 0, 0.4, 10);
    records.extend(block("alice", 0, 1, 0, 2.0, 10));
    records.extend(block("alice", 0, 2, 0, 0.4, 3));
    records
}

#[test]
fn coverage_is_population_weighted_over_sufficient_clusters() {
    let cfg = small_floors();
    let profiles = aggregate(&mixed_actor(), &cfg);
    assert_eq!(profiles.len(), 1);
    let p = &profiles[0];

    let cov = p.coverage.sufficient().unwrap();
    assert!((cov.coverage - 0.5).abs() < 1e-12);
    assert!((cov.surface_area - 0.5).abs() < 1e-12);
    assert!((0.0..=2.0).contains(&cov.friction_surface));
    assert_eq!(cov.firmware_clusters, 1);
    assert_eq!(cov.sufficient_clusters, 2);

    assert_eq!(p.cluster(ClusterId(0)).unwrap().band(), Some(Band::Firmware));
    assert_eq!(p.cluster(ClusterId(1)).unwrap().band(), Some(Band::System2));
    assert!(matches!(
        p.cluster(ClusterId(2)).unwrap().stats,
        Aggregate::Insufficient { n: 3, floor: 5 }
    ));
}

#[test]
fn every_record_is_accounted_for() {
    let cfg = small_floors();
    let p = &aggregate(&mixed_actor(), &cfg)[0];
    assert_eq!(p.records_total, 23);
    assert_eq!(p.records_sufficient, 20);
    assert_eq!(p.records_insufficient, 3);
    let per_cluster: usize = p.clusters.iter().map(|c| c.n).sum();
    assert_eq!(per_cluster, p.records_total);
}

#[test]
fn thin_profiles_report_insufficient_coverage() {
    let cfg = EngineConfig::default();
    let p = &aggregate(&mixed_actor(), &cfg)[0];
    assert_eq!(
        p.coverage,
        Aggregate::Insufficient {
            n: 23,
            floor: cfg.min_actor_cluster_samples
        }
    );
    assert_eq!(p.coverage_value(), None);
    assert!(p.clusters.iter().all(|c| !c.stats.is_sufficient()));
}

#[test]
fn frequent_severe_errors_keep_a_fast_cluster_out_of_firmware() {
    let cfg = small_floors();
    let mut records = block("bob", 0, 0, 0, 0.4, 6);
    for i in 0..4 {
        let mut r = record("bob", 0, 0, 0, 0.4, true);
        r.situation_id = format!("severe{i}");
        records.push(r);
    }
    let p = &aggregate(&records, &cfg)[0];
    let stats = p.cluster(ClusterId(0)).unwrap().stats.sufficient().unwrap();
    assert!((stats.severe_rate.unwrap() - 0.4).abs() < 1e-12);
    assert_eq!(stats.band, Band::Mixed);
    assert_eq!(p.coverage_value(), Some(0.0));
}

#[test]
fn relaxing_the_firmware_cutoff_never_lowers_coverage() {
    let mut records = Vec::new();
    for (cluster, mean) in [(0, 0.35), (1, 0.62), (2, 0.74), (3, 0.79), (4, 0.95), (5, 1.7)] {
        records.extend(block("carol", 0, cluster, 0, mean, 8));
    }

    let mut last = 0.0;
    for step in 0..12 {
        let cfg = EngineConfig {
            firmware_cutoff: 0.3 + step as f64 * 0.05,
            ..small_floors()
        };
        let coverage = aggregate(&records, &cfg)[0].coverage_value().unwrap();
        assert!((0.0..=1.0).contains(&coverage));
        assert!(coverage >= last, "coverage fell at cutoff {}", cfg.firmware_cutoff);
        last = coverage;
    }
    assert!(last > 0.5);
}

#[test]
fn profiles_are_partitioned_by_actor_epoch_and_period() {
    let cfg = small_floors();
    let mut records = block("dave", 0, 0, 0, 0.4, 5);
    records.extend(block("dave", 0, 0, 1, 0.4, 5));
    records.extend(block("dave", 1, 0, 1, 0.4, 5));
    records.extend(block("erin", 0, 0, 0, 0.4, 5));

    let keys: Vec<(String, u32, usize)> = aggregate(&records, &cfg)
        .into_iter()
        .map(|p| (p.actor_id, p.epoch.0, p.period))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("dave".to_string(), 0, 0),
            ("dave".to_string(), 0, 1),
            ("dave".to_string(), 1, 1),
            ("erin".to_string(), 0, 0),
        ]
    );
}
