//! Error types shared across the engine.
//!
//! Recoverable conditions (malformed events, degenerate statistics, oracle
//! gaps) never surface here: they are logged and turned into explicit
//! "insufficient" values. What remains are configuration problems and the
//! fatal cross-epoch mismatch.

use thiserror::Error;

use crate::cluster::{ClusterId, EpochId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("clustering failed: {0}")]
    Clustering(String),

    /// A cluster id could not be resolved in the requested epoch. This means a
    /// migration map is missing upstream; the computation must stop.
    #[error("epoch mismatch: cluster {cluster:?} of epoch {from:?} has no mapping into epoch {to:?}")]
    EpochMismatch {
        cluster: ClusterId,
        from: EpochId,
        to: EpochId,
    },

    #[error("epoch mismatch: profiles belong to epochs {left:?} and {right:?}")]
    EpochPair { left: EpochId, right: EpochId },

    #[error("artifact write failed: {0}")]
    Sink(#[from] crate::sink::SinkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
