mod common;

use std::collections::BTreeMap;

use common::{block, small_floors};
use friction_engine::cluster::{ClusterId, EpochId, MigrationMap};
use friction_engine::error::EngineError;
use friction_engine::growth::{track, Alignment, BandTransition, GrowthSlope};
use friction_engine::profile::aggregate;

#[test]
fn cluster_moving_from_system2_to_firmware_is_gained() {
    let cfg = small_floors();
    let mut records = block("alice", 0, 0, 0, 2.0, 10);
    records.extend(block("alice", 0, 1, 0, 0.4, 10));
    records.extend(block("alice", 0, 0, 1, 0.5, 10));
    records.extend(block("alice", 0, 1, 1, 0.4, 10));
    let profiles = aggregate(&records, &cfg);

    let t = track("alice", &profiles, &Alignment::new(EpochId(0)), &cfg).unwrap();
    assert_eq!(t.coverage_series(), vec![(0, 0.5), (1, 1.0)]);
    assert_eq!(t.gained_clusters(), vec![ClusterId(0)]);
    assert!(t.lost.is_empty());
    match t.slope {
        GrowthSlope::Estimated { slope, points } => {
            assert_eq!(points, 2);
            assert!((slope - 0.5).abs() < 1e-12);
        }
        other => panic!("unexpected slope {other:?}"),
    }
}

#[test]
fn gain_and_later_loss_are_both_reported() {
    let cfg = small_floors();
    let mut records = block("dave", 0, 0, 0, 2.0, 10);
    records.extend(block("dave", 0, 0, 1, 0.4, 10));
    records.extend(block("dave", 0, 0, 2, 2.0, 10));
    let profiles = aggregate(&records, &cfg);

    let t = track("dave", &profiles, &Alignment::new(EpochId(0)), &cfg).unwrap();
    assert_eq!(t.coverage_series(), vec![(0, 0.0), (1, 1.0), (2, 0.0)]);
    assert_eq!(
        t.gained,
        vec![BandTransition {
            cluster: ClusterId(0),
            from_period: 0,
            to_period: 1,
        }]
    );
    assert_eq!(
        t.lost,
        vec![BandTransition {
            cluster: ClusterId(0),
            from_period: 1,
            to_period: 2,
        }]
    );
    assert_eq!(t.lost_clusters(), vec![ClusterId(0)]);
}

#[test]
fn mixed_step_breaks_the_transition() {
    let cfg = small_floors();
    let mut records = block("erin", 0, 0, 0, 2.0, 10);
    records.extend(block("erin", 0, 0, 1, 1.0, 10));
    records.extend(block("erin", 0, 0, 2, 0.4, 10));
    let profiles = aggregate(&records, &cfg);

    let t = track("erin", &profiles, &Alignment::new(EpochId(0)), &cfg).unwrap();
    assert!(t.gained.is_empty());
    assert!(t.lost.is_empty());
}

#[test]
fn single_period_slope_is_insufficient() {
    let cfg = small_floors();
    let profiles = aggregate(&block("bob", 0, 0, 0, 0.4, 10), &cfg);
    let t = track("bob", &profiles, &Alignment::new(EpochId(0)), &cfg).unwrap();
    assert_eq!(t.slope, GrowthSlope::Insufficient { points: 1, floor: 2 });
}

#[test]
fn crossing_epochs_without_a_map_is_fatal() {
    let cfg = small_floors();
    let mut records = block("carol", 0, 3, 0, 2.0, 10);
    records.extend(block("carol", 1, 0, 1, 0.4, 10));
    let profiles = aggregate(&records, &cfg);

    let err = track("carol", &profiles, &Alignment::new(EpochId(1)), &cfg).unwrap_err();
    assert!(matches!(
        err,
        EngineError::EpochMismatch {
            from: EpochId(0),
            to: EpochId(1),
            ..
        }
    ));
}

#[test]
fn migration_map_aligns_old_clusters_into_the_target_epoch() {
    let cfg = small_floors();
    let mut records = block("carol", 0, 3, 0, 2.0, 10);
    records.extend(block("carol", 1, 0, 1, 0.4, 10));
    let profiles = aggregate(&records, &cfg);

    let mut alignment = Alignment::new(EpochId(1));
    alignment
        .insert(MigrationMap {
            from: EpochId(0),
            to: EpochId(1),
            mapping: BTreeMap::from([(ClusterId(3), ClusterId(0))]),
        })
        .unwrap();

    let t = track("carol", &profiles, &alignment, &cfg).unwrap();
    assert_eq!(t.target_epoch, EpochId(1));
    assert_eq!(t.points[0].source_epochs, vec![EpochId(0)]);
    assert_eq!(t.points[0].clusters[0].cluster, ClusterId(0));
    assert_eq!(t.gained_clusters(), vec![ClusterId(0)]);
}

#[test]
fn alignment_rejects_maps_into_another_epoch() {
    let mut alignment = Alignment::new(EpochId(2));
    let err = alignment
        .insert(MigrationMap {
            from: EpochId(0),
            to: EpochId(1),
            mapping: BTreeMap::new(),
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::EpochPair { .. }));
}
