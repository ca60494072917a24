#![forbid(unsafe_code)]

//! # friction-engine
//!
//! Measures where a decision maker runs on firmware (fast, automatic
//! responses) and where they fall back to deliberate System-2 reasoning.
//!
//! Every decision event is normalized against the actor's own latency
//! baseline and classified into a friction band. Events land in situation
//! clusters built per epoch; per-cluster aggregates give each actor a firmware
//! profile with a coverage figure, growth across periods, and cross-actor
//! comparisons. A statistics suite tests how latency, complexity and
//! triggers relate to severe errors.
//!
//! Outcomes come with the events or from an external [`oracle::OutcomeOracle`]
//! whose answers are memoized in a SQLite cache.

pub mod analysis;
pub mod cache;
pub mod cluster;
pub mod compare;
pub mod config;
pub mod error;
pub mod event;
pub mod features;
pub mod friction;
pub mod growth;
pub mod oracle;
pub mod pipeline;
pub mod profile;
pub mod sink;
pub mod synthetic;

pub use cache::{EvaluationCache, EvaluationCacheKey, MemoryEvaluationCache, SqliteEvaluationCache};
pub use cluster::{ClusterEpoch, ClusterId, ClusterRef, EpochId, MigrationMap};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use event::{AlternativeRanking, DecisionEvent, ExternalRank, RankContext, TimePressure};
pub use features::{FeatureVector, SituationFeatures};
pub use friction::{Band, FailureType, FrictionLevel, FrictionRecord, Severity};
pub use growth::GrowthTrajectory;
pub use oracle::{CacheOnlyOracle, CachedOracle, OutcomeOracle};
pub use pipeline::{run_batch, run_batch_with_oracle, write_artifacts, BatchOutput};
pub use profile::{Aggregate, FirmwareProfile};
