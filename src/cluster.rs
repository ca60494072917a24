//! Situation clustering over a batch epoch.
//!
//! k-means++ initialization from a fixed seed followed by Lloyd iterations.
//! An epoch is built once from the complete set of vectors it covers and is
//! immutable afterwards. Cluster ids are opaque: they only carry meaning
//! inside their epoch, and crossing epochs requires a [`MigrationMap`].

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureVector, FEATURE_DIM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpochId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

/// A (epoch, cluster) pair. The only cluster reference that is safe to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterRef {
    pub epoch: EpochId,
    pub cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SituationCluster {
    pub id: ClusterId,
    pub centroid: FeatureVector,
    pub members: usize,
}

/// Record of a cluster folded away for being under the population floor.
#[derive(Debug, Clone, Serialize)]
pub struct MergeNote {
    pub original_index: usize,
    pub population: usize,
    pub merged_into: ClusterId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterEpoch {
    pub id: EpochId,
    pub seed: u64,
    pub clusters: Vec<SituationCluster>,
    pub iterations: usize,
    pub converged: bool,
    /// Within-cluster sum of squares after merging.
    pub wcss: f64,
    pub merged: Vec<MergeNote>,
}

impl ClusterEpoch {
    pub fn cluster(&self, id: ClusterId) -> Option<&SituationCluster> {
        self.clusters.get(id.0 as usize).filter(|c| c.id == id)
    }

    pub fn contains(&self, id: ClusterId) -> bool {
        self.cluster(id).is_some()
    }

    /// Nearest cluster for an arbitrary vector. Ties go to the lowest id.
    pub fn assign(&self, v: &FeatureVector) -> ClusterId {
        let centroids: Vec<FeatureVector> = self.clusters.iter().map(|c| c.centroid).collect();
        ClusterId(nearest(v, &centroids) as u32)
    }

    pub fn total_members(&self) -> usize {
        self.clusters.iter().map(|c| c.members).sum()
    }
}

/// An epoch together with the cluster of every input vector.
#[derive(Debug, Clone)]
pub struct EpochBuild {
    pub epoch: ClusterEpoch,
    /// `assignments[i]` is the cluster of the i-th input vector.
    pub assignments: Vec<ClusterId>,
}

// ---------------------------------------------------------------------
//  k-means
// ---------------------------------------------------------------------

fn nearest(v: &FeatureVector, centroids: &[FeatureVector]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (j, c) in centroids.iter().enumerate() {
        let d = v.distance_sq(c);
        if d < best_d {
            best_d = d;
            best = j;
        }
    }
    best
}

fn distinct_count(vectors: &[FeatureVector]) -> usize {
    let mut keys: Vec<[u64; FEATURE_DIM]> = vectors
        .iter()
        .map(|v| {
            let mut k = [0u64; FEATURE_DIM];
            for (slot, x) in k.iter_mut().zip(v.0.iter()) {
                *slot = x.to_bits();
            }
            k
        })
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

fn kmeans_plus_plus(vectors: &[FeatureVector], k: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    let n = vectors.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..n)]);

    let mut d2: Vec<f64> = vectors.iter().map(|v| v.distance_sq(&centroids[0])).collect();
    while centroids.len() < k {
        let total: f64 = d2.iter().sum();
        if total <= 0.0 {
            break;
        }
        let target = rng.gen::<f64>() * total;
        let mut cum = 0.0;
        let mut pick = n - 1;
        for (i, d) in d2.iter().enumerate() {
            cum += d;
            if cum >= target && *d > 0.0 {
                pick = i;
                break;
            }
        }
        let c = vectors[pick];
        centroids.push(c);
        for (slot, v) in d2.iter_mut().zip(vectors.iter()) {
            *slot = slot.min(v.distance_sq(&c));
        }
    }
    centroids
}

fn recompute(
    vectors: &[FeatureVector],
    assignments: &[usize],
    previous: &[FeatureVector],
) -> (Vec<FeatureVector>, Vec<usize>) {
    let k = previous.len();
    let mut sums = vec![[0.0f64; FEATURE_DIM]; k];
    let mut counts = vec![0usize; k];
    for (v, &a) in vectors.iter().zip(assignments.iter()) {
        counts[a] += 1;
        for (s, x) in sums[a].iter_mut().zip(v.0.iter()) {
            *s += x;
        }
    }
    let centroids = (0..k)
        .map(|j| {
            if counts[j] == 0 {
                // empty cluster keeps its last position
                previous[j]
            } else {
                let mut c = [0.0; FEATURE_DIM];
                for (slot, s) in c.iter_mut().zip(sums[j].iter()) {
                    *slot = s / counts[j] as f64;
                }
                FeatureVector(c)
            }
        })
        .collect();
    (centroids, counts)
}

/// Build a clustering epoch from every vector observed in it.
///
/// Must be called with the complete vector set of the epoch; the result is not
/// incremental.
pub fn build_epoch(
    id: EpochId,
    vectors: &[FeatureVector],
    cfg: &EngineConfig,
) -> EngineResult<EpochBuild> {
    if vectors.is_empty() {
        return Err(EngineError::Clustering(format!("epoch {} has no vectors", id.0)));
    }
    if vectors.len() < cfg.min_cluster_population {
        return Err(EngineError::Clustering(format!(
            "epoch {} has {} vectors, below the cluster population floor {}",
            id.0,
            vectors.len(),
            cfg.min_cluster_population
        )));
    }

    let k = cfg.effective_k(vectors.len()).min(distinct_count(vectors)).max(1);
    let mut rng = StdRng::seed_from_u64(cfg.cluster_seed);
    let mut centroids = kmeans_plus_plus(vectors, k, &mut rng);

    debug!(epoch = id.0, n = vectors.len(), k = centroids.len(), "starting k-means");

    let mut assignments = vec![0usize; vectors.len()];
    let mut iterations = 0;
    let mut converged = false;
    for iter in 0..cfg.kmeans_max_iters {
        iterations = iter + 1;
        assignments = vectors.par_iter().map(|v| nearest(v, &centroids)).collect();
        let (next, _) = recompute(vectors, &assignments, &centroids);
        let movement = centroids
            .iter()
            .zip(next.iter())
            .map(|(a, b)| a.distance_sq(b).sqrt())
            .fold(0.0f64, f64::max);
        centroids = next;
        if movement < cfg.kmeans_tol {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!(epoch = id.0, iterations, "k-means did not converge");
    }
    // Final assignment against the final centroids.
    assignments = vectors.par_iter().map(|v| nearest(v, &centroids)).collect();
    let (_, counts) = recompute(vectors, &assignments, &centroids);

    // -- Population floor ----------------------------------------------------
    let survivors: Vec<usize> = (0..centroids.len())
        .filter(|&j| counts[j] >= cfg.min_cluster_population)
        .collect();
    if survivors.is_empty() {
        return Err(EngineError::Clustering(format!(
            "epoch {}: no cluster reaches the population floor {}",
            id.0, cfg.min_cluster_population
        )));
    }
    let survivor_centroids: Vec<FeatureVector> = survivors.iter().map(|&j| centroids[j]).collect();
    let mut remap = vec![0usize; centroids.len()];
    for (new_idx, &old_idx) in survivors.iter().enumerate() {
        remap[old_idx] = new_idx;
    }

    let mut merged = Vec::new();
    for j in 0..centroids.len() {
        if counts[j] == 0 || counts[j] >= cfg.min_cluster_population {
            continue;
        }
        let target = nearest(&centroids[j], &survivor_centroids);
        info!(
            epoch = id.0,
            cluster = j,
            population = counts[j],
            merged_into = target,
            "merging under-populated cluster into nearest survivor"
        );
        merged.push(MergeNote {
            original_index: j,
            population: counts[j],
            merged_into: ClusterId(target as u32),
        });
    }

    let final_assignments: Vec<usize> = vectors
        .iter()
        .zip(assignments.iter())
        .map(|(v, &a)| {
            if counts[a] >= cfg.min_cluster_population {
                remap[a]
            } else {
                nearest(v, &survivor_centroids)
            }
        })
        .collect();
    let (final_centroids, final_counts) =
        recompute(vectors, &final_assignments, &survivor_centroids);

    let wcss = vectors
        .iter()
        .zip(final_assignments.iter())
        .map(|(v, &a)| v.distance_sq(&final_centroids[a]))
        .sum();

    let clusters = final_centroids
        .into_iter()
        .zip(final_counts)
        .enumerate()
        .map(|(i, (centroid, members))| SituationCluster {
            id: ClusterId(i as u32),
            centroid,
            members,
        })
        .collect();

    Ok(EpochBuild {
        epoch: ClusterEpoch {
            id,
            seed: cfg.cluster_seed,
            clusters,
            iterations,
            converged,
            wcss,
            merged,
        },
        assignments: final_assignments
            .into_iter()
            .map(|a| ClusterId(a as u32))
            .collect(),
    })
}

// ---------------------------------------------------------------------
//  Migration
// ---------------------------------------------------------------------

/// Old-epoch cluster → new-epoch cluster, by nearest centroid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationMap {
    pub from: EpochId,
    pub to: EpochId,
    pub mapping: BTreeMap<ClusterId, ClusterId>,
}

impl MigrationMap {
    pub fn identity(epoch: &ClusterEpoch) -> Self {
        Self {
            from: epoch.id,
            to: epoch.id,
            mapping: epoch.clusters.iter().map(|c| (c.id, c.id)).collect(),
        }
    }

    /// Resolve a reference into the target epoch.
    pub fn resolve(&self, r: ClusterRef) -> EngineResult<ClusterRef> {
        let mismatch = EngineError::EpochMismatch {
            cluster: r.cluster,
            from: r.epoch,
            to: self.to,
        };
        if r.epoch != self.from {
            return Err(mismatch);
        }
        match self.mapping.get(&r.cluster) {
            Some(&cluster) => Ok(ClusterRef {
                epoch: self.to,
                cluster,
            }),
            None => Err(mismatch),
        }
    }

    /// Chain `self` (A → B) with `next` (B → C) into A → C.
    pub fn compose(&self, next: &MigrationMap) -> EngineResult<MigrationMap> {
        if self.to != next.from {
            return Err(EngineError::EpochPair {
                left: self.to,
                right: next.from,
            });
        }
        let mut mapping = BTreeMap::new();
        for (&a, &b) in &self.mapping {
            let c = next.mapping.get(&b).copied().ok_or(EngineError::EpochMismatch {
                cluster: b,
                from: next.from,
                to: next.to,
            })?;
            mapping.insert(a, c);
        }
        Ok(MigrationMap {
            from: self.from,
            to: next.to,
            mapping,
        })
    }
}

/// Assign every cluster of `old` to the nearest centroid of `new`.
pub fn migrate(old: &ClusterEpoch, new: &ClusterEpoch) -> MigrationMap {
    let mapping = old
        .clusters
        .iter()
        .map(|c| (c.id, new.assign(&c.centroid)))
        .collect();
    MigrationMap {
        from: old.id,
        to: new.id,
        mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(center: f64, n: usize) -> Vec<FeatureVector> {
        (0..n)
            .map(|i| {
                let jitter = (i as f64 % 5.0) * 0.002;
                FeatureVector([center + jitter; FEATURE_DIM])
            })
            .collect()
    }

    #[test]
    fn separated_blobs_get_separate_clusters() {
        let mut vectors = blob(0.1, 30);
        vectors.extend(blob(0.9, 30));
        let cfg = EngineConfig {
            cluster_k: Some(2),
            ..EngineConfig::default()
        };
        let build = build_epoch(EpochId(0), &vectors, &cfg).unwrap();
        assert_eq!(build.epoch.clusters.len(), 2);
        assert_ne!(build.assignments[0], build.assignments[59]);
        assert_eq!(build.epoch.total_members(), 60);
    }

    #[test]
    fn too_few_vectors_is_an_error() {
        let cfg = EngineConfig::default();
        assert!(build_epoch(EpochId(0), &blob(0.5, 3), &cfg).is_err());
    }
}
