//! Batch pipeline: decision events → records → profiles → growth → tests.
//!
//! Phases run in order with a barrier between them:
//! 1. **Validate and extract**: drop malformed events, extract feature vectors
//!    (parallel), then one ordered pass per actor for baselines and prior
//!    context.
//! 2. **Cluster**: build each epoch from its complete vector set. An epoch
//!    segment too thin to cluster is folded into its neighbour.
//! 3. **Classify and aggregate**: classify every event (parallel), aggregate
//!    per (actor, epoch, period), then growth and statistics once every
//!    partition is done.

use std::collections::BTreeMap;
use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::{self, AnalysisReport};
use crate::cluster::{self, ClusterEpoch, ClusterRef, EpochId, MigrationMap};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event::{validate_events, DecisionEvent, DropReport};
use crate::features::{self, FeatureVector};
use crate::friction::{self, ClassifierInput, FrictionRecord};
use crate::growth::{self, Alignment, GrowthTrajectory};
use crate::oracle::{resolve_outcomes, CachedOracle, ResolutionReport};
use crate::profile::{self, FirmwareProfile};
use crate::sink;

// =============================================================================
// Types
// =============================================================================

/// An epoch segment below the cluster population floor, and the epoch that
/// took in its events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThinEpoch {
    pub segment: usize,
    pub events: usize,
    pub merged_into: EpochId,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutput {
    pub drops: DropReport,
    pub epochs: Vec<ClusterEpoch>,
    pub thin_epochs: Vec<ThinEpoch>,
    /// Each map leads from one epoch straight into the last epoch.
    pub migrations: Vec<MigrationMap>,
    pub records: Vec<FrictionRecord>,
    pub profiles: Vec<FirmwareProfile>,
    pub trajectories: Vec<GrowthTrajectory>,
    pub analysis: AnalysisReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactCounts {
    pub records: usize,
    pub profiles: usize,
    pub trajectories: usize,
    pub tests: usize,
}

// =============================================================================
// Phases
// =============================================================================

/// Group event indices by epoch segment. Segments below the population floor
/// join the previous segment, or the next one when nothing precedes them.
fn segment_epochs(events: &[DecisionEvent], cfg: &EngineConfig) -> (Vec<(usize, Vec<usize>)>, Vec<ThinEpoch>) {
    let mut by_epoch: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, e) in events.iter().enumerate() {
        by_epoch.entry(cfg.epoch_index(e.timestamp)).or_default().push(i);
    }

    let floor = cfg.min_cluster_population;
    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut pending: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut thin = Vec::new();
    for (segment, mut members) in by_epoch {
        if members.len() >= floor {
            for (s, m) in pending.drain(..) {
                thin.push(ThinEpoch {
                    segment: s,
                    events: m.len(),
                    merged_into: EpochId(segment as u32),
                });
                members.extend(m);
            }
            groups.push((segment, members));
        } else if let Some((target, last)) = groups.last_mut() {
            thin.push(ThinEpoch {
                segment,
                events: members.len(),
                merged_into: EpochId(*target as u32),
            });
            last.extend(members);
        } else {
            pending.push((segment, members));
        }
    }
    // Nothing reached the floor: cluster everything as the first segment.
    if groups.is_empty() {
        let mut drained = pending.into_iter();
        if let Some((first, mut members)) = drained.next() {
            for (s, m) in drained {
                thin.push(ThinEpoch {
                    segment: s,
                    events: m.len(),
                    merged_into: EpochId(first as u32),
                });
                members.extend(m);
            }
            groups.push((first, members));
        }
    }

    for t in &thin {
        warn!(
            segment = t.segment,
            events = t.events,
            merged_into = t.merged_into.0,
            floor,
            "epoch below the cluster population floor; merged into a neighbour"
        );
    }
    (groups, thin)
}

fn build_epochs(
    events: &[DecisionEvent],
    vectors: &[FeatureVector],
    groups: Vec<(usize, Vec<usize>)>,
    cfg: &EngineConfig,
) -> EngineResult<(Vec<ClusterEpoch>, Vec<ClusterRef>)> {
    let mut epochs = Vec::with_capacity(groups.len());
    let mut refs = vec![
        ClusterRef {
            epoch: EpochId(0),
            cluster: cluster::ClusterId(0),
        };
        events.len()
    ];
    for (idx, members) in groups {
        let id = EpochId(idx as u32);
        let epoch_vectors: Vec<FeatureVector> = members.iter().map(|&i| vectors[i]).collect();
        let build = cluster::build_epoch(id, &epoch_vectors, cfg)?;
        info!(
            epoch = id.0,
            vectors = epoch_vectors.len(),
            clusters = build.epoch.clusters.len(),
            merged = build.epoch.merged.len(),
            converged = build.epoch.converged,
            "epoch built"
        );
        for (&i, &c) in members.iter().zip(build.assignments.iter()) {
            refs[i] = ClusterRef { epoch: id, cluster: c };
        }
        epochs.push(build.epoch);
    }
    Ok((epochs, refs))
}

/// Maps from every epoch into the last one, composed along consecutive pairs.
fn migrations_to_last(epochs: &[ClusterEpoch]) -> EngineResult<Vec<MigrationMap>> {
    let Some(last) = epochs.last() else {
        return Ok(Vec::new());
    };
    let mut maps = Vec::with_capacity(epochs.len());
    let mut carried = MigrationMap::identity(last);
    maps.push(carried.clone());
    for pair in epochs.windows(2).rev() {
        let step = cluster::migrate(&pair[0], &pair[1]);
        carried = step.compose(&carried)?;
        maps.push(carried.clone());
    }
    maps.reverse();
    Ok(maps)
}

fn track_all(
    profiles: &[FirmwareProfile],
    epochs: &[ClusterEpoch],
    migrations: &[MigrationMap],
    cfg: &EngineConfig,
) -> EngineResult<Vec<GrowthTrajectory>> {
    let Some(last) = epochs.last() else {
        return Ok(Vec::new());
    };
    let mut alignment = Alignment::new(last.id);
    for map in migrations {
        alignment.insert(map.clone())?;
    }
    let mut actors: Vec<&str> = profiles.iter().map(|p| p.actor_id.as_str()).collect();
    actors.dedup();
    actors
        .into_iter()
        .map(|actor| growth::track(actor, profiles, &alignment, cfg))
        .collect()
}

// =============================================================================
// Entry points
// =============================================================================

/// Run the whole pipeline over a batch of events. Deterministic: the same
/// events and configuration always give the same output, whatever their input
/// order.
pub fn run_batch(events: Vec<DecisionEvent>, cfg: &EngineConfig) -> EngineResult<BatchOutput> {
    cfg.validate()?;

    // -- Phase 1 ------------------------------------------------------------
    let (mut events, drops) = validate_events(events);
    events.sort_by(|a, b| {
        (a.actor_id.as_str(), a.timestamp, a.situation_id.as_str())
            .cmp(&(b.actor_id.as_str(), b.timestamp, b.situation_id.as_str()))
    });
    let vectors: Vec<FeatureVector> = events
        .par_iter()
        .map(|e| features::extract(&e.features, &cfg.feature_scales))
        .collect();
    let contexts = friction::prepare_contexts(&events, cfg);

    // -- Phase 2 ------------------------------------------------------------
    let (groups, thin_epochs) = segment_epochs(&events, cfg);
    let (epochs, refs) = build_epochs(&events, &vectors, groups, cfg)?;
    let migrations = migrations_to_last(&epochs)?;

    // -- Phase 3 ------------------------------------------------------------
    let inputs: Vec<ClassifierInput<'_>> = events
        .iter()
        .enumerate()
        .map(|(i, e)| ClassifierInput {
            event: e,
            vector: &vectors[i],
            cluster: refs[i],
            period: cfg.period_index(e.timestamp),
            context: contexts[i],
        })
        .collect();
    let records = friction::classify_batch(&inputs, cfg);
    let profiles = profile::aggregate(&records, cfg);
    let trajectories = track_all(&profiles, &epochs, &migrations, cfg)?;
    let analysis = analysis::run_suite(&records, &profiles, cfg);

    info!(
        accepted = drops.accepted,
        dropped = drops.dropped.len(),
        records = records.len(),
        profiles = profiles.len(),
        epochs = epochs.len(),
        "batch complete"
    );

    Ok(BatchOutput {
        drops,
        epochs,
        thin_epochs,
        migrations,
        records,
        profiles,
        trajectories,
        analysis,
    })
}

/// Fill missing outcomes from the oracle, then run the batch.
pub async fn run_batch_with_oracle(
    events: Vec<DecisionEvent>,
    oracle: &CachedOracle,
    cfg: &EngineConfig,
) -> EngineResult<(BatchOutput, ResolutionReport)> {
    let (events, resolution) = resolve_outcomes(events, oracle, cfg).await;
    let cfg = cfg.clone();
    let output = tokio::task::spawn_blocking(move || run_batch(events, &cfg))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
    Ok((output, resolution))
}

/// Write the result tables into `dir`.
pub fn write_artifacts(output: &BatchOutput, dir: impl AsRef<Path>) -> EngineResult<ArtifactCounts> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let counts = ArtifactCounts {
        records: sink::write_all(dir.join(sink::FRICTION_RECORDS_FILE), output.records.clone())?,
        profiles: sink::write_all(dir.join(sink::FIRMWARE_PROFILES_FILE), output.profiles.clone())?,
        trajectories: sink::write_all(dir.join(sink::TRAJECTORIES_FILE), output.trajectories.clone())?,
        tests: sink::write_all(dir.join(sink::TESTS_FILE), output.analysis.results())?,
    };
    std::fs::write(dir.join("analysis.json"), serde_json::to_string_pretty(&output.analysis)?)?;
    Ok(counts)
}
