mod common;

use common::{block, small_floors};
use friction_engine::compare::{compare, Direction, MatchBasis};
use friction_engine::error::EngineError;
use friction_engine::profile::{aggregate, latest_profile};
use friction_engine::{ClusterId, EpochId};

#[test]
fn faster_actor_is_flagged_as_holding_the_firmware() {
    let cfg = small_floors();
    let mut records = block("a", 0, 0, 0, 0.5, 10);
    records.extend(block("a", 0, 1, 0, 1.0, 10));
    records.extend(block("b", 0, 0, 0, 1.8, 10));
    records.extend(block("b", 0, 1, 0, 1.1, 10));
    let profiles = aggregate(&records, &cfg);
    let (a, b) = (&profiles[0], &profiles[1]);

    let basis = MatchBasis::SkillBand { lower: 1800.0 };
    let ab = compare(a, b, basis.clone(), &cfg).unwrap();
    assert_eq!(ab.shared_clusters, 2);
    assert_eq!(ab.divergent.len(), 1);
    let d = &ab.divergent[0];
    assert_eq!(d.cluster, ClusterId(0));
    assert!((d.difference - 1.3).abs() < 1e-9);
    assert_eq!(d.direction, Direction::AHasFirmware);

    let ba = compare(b, a, basis, &cfg).unwrap();
    assert_eq!(ba.divergent.len(), 1);
    assert_eq!(ba.divergent[0].direction, d.direction.flipped());
    assert!((ba.divergent[0].difference + d.difference).abs() < 1e-12);
}

#[test]
fn clusters_sufficient_for_only_one_actor_are_skipped() {
    let cfg = small_floors();
    let mut records = block("a", 0, 0, 0, 0.5, 10);
    records.extend(block("b", 0, 0, 0, 1.8, 2));
    let profiles = aggregate(&records, &cfg);
    let c = compare(&profiles[0], &profiles[1], MatchBasis::Age { years: 12 }, &cfg).unwrap();
    assert_eq!(c.shared_clusters, 0);
    assert!(c.divergent.is_empty());
}

#[test]
fn profiles_from_different_epochs_are_rejected() {
    let cfg = small_floors();
    let mut records = block("a", 0, 0, 0, 0.5, 10);
    records.extend(block("b", 1, 0, 0, 1.8, 10));
    let profiles = aggregate(&records, &cfg);
    let err = compare(&profiles[0], &profiles[1], MatchBasis::Age { years: 30 }, &cfg).unwrap_err();
    assert!(matches!(err, EngineError::EpochPair { .. }));
}

#[test]
fn period_split_by_an_epoch_boundary_resolves_to_the_latest_epoch() {
    let cfg = small_floors();
    let mut records = block("a", 0, 0, 3, 0.5, 10);
    records.extend(block("a", 1, 2, 3, 1.8, 6));
    records.extend(block("a", 1, 2, 4, 1.8, 6));
    let profiles = aggregate(&records, &cfg);
    assert_eq!(profiles.iter().filter(|p| p.period == 3).count(), 2);

    let picked = latest_profile(&profiles, "a", 3).unwrap();
    assert_eq!(picked.epoch, EpochId(1));
    assert_eq!(picked.records_total, 6);
    assert!(latest_profile(&profiles, "a", 9).is_none());
    assert!(latest_profile(&profiles, "z", 3).is_none());
}
