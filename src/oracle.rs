//! Outcome oracle: grades a response against the best available one.
//!
//! The oracle is external and slow. [`CachedOracle`] memoizes results in an
//! [`EvaluationCache`] and bounds each call with a timeout; [`resolve_outcomes`]
//! fans a batch out with bounded concurrency. A failure only affects its own
//! event, which keeps `outcome = None` and is reported as a gap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheError, CachedEvaluation, EvaluationCache, EvaluationCacheKey};
use crate::config::EngineConfig;
use crate::event::DecisionEvent;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle timed out after {0} ms")]
    Timeout(u64),
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("event has no response id")]
    MissingResponse,
    #[error("oracle returned an invalid magnitude {0}")]
    InvalidMagnitude(f64),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[async_trait]
pub trait OutcomeOracle: Send + Sync {
    /// Stable identifier; part of every cache key.
    fn id(&self) -> &str;
    async fn evaluate(&self, situation_id: &str, response_id: &str) -> Result<CachedEvaluation, OracleError>;
}

/// An oracle that knows nothing. Behind a [`CachedOracle`] it turns the cache
/// into the only source of outcomes.
#[derive(Debug, Clone)]
pub struct CacheOnlyOracle {
    id: String,
}

impl CacheOnlyOracle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl OutcomeOracle for CacheOnlyOracle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, situation_id: &str, _response_id: &str) -> Result<CachedEvaluation, OracleError> {
        Err(OracleError::Unavailable(format!("no cached evaluation for {situation_id}")))
    }
}

#[derive(Clone)]
pub struct CachedOracle {
    oracle: Arc<dyn OutcomeOracle>,
    cache: Arc<dyn EvaluationCache>,
    timeout: Duration,
}

impl CachedOracle {
    pub fn new(oracle: Arc<dyn OutcomeOracle>, cache: Arc<dyn EvaluationCache>, timeout: Duration) -> Self {
        Self {
            oracle,
            cache,
            timeout,
        }
    }

    pub async fn evaluate(&self, situation_id: &str, response_id: &str) -> Result<CachedEvaluation, OracleError> {
        let key = EvaluationCacheKey::new(self.oracle.id(), situation_id, response_id);
        match self.cache.get(&key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(err) => warn!(situation = situation_id, error = %err, "evaluation cache read failed"),
        }

        let fresh = tokio::time::timeout(self.timeout, self.oracle.evaluate(situation_id, response_id))
            .await
            .map_err(|_| OracleError::Timeout(self.timeout.as_millis() as u64))??;
        if !(fresh.error_magnitude.is_finite() && fresh.error_magnitude >= 0.0) {
            return Err(OracleError::InvalidMagnitude(fresh.error_magnitude));
        }

        if let Err(err) = self.cache.put(&key, &fresh).await {
            warn!(situation = situation_id, error = %err, "evaluation cache write failed");
        }
        Ok(fresh)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeGap {
    pub index: usize,
    pub actor_id: String,
    pub situation_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub requested: usize,
    pub resolved: usize,
    pub gaps: Vec<OutcomeGap>,
}

/// Fill in missing outcomes. Events that already carry one are left alone.
pub async fn resolve_outcomes(
    mut events: Vec<DecisionEvent>,
    oracle: &CachedOracle,
    cfg: &EngineConfig,
) -> (Vec<DecisionEvent>, ResolutionReport) {
    let pending: Vec<(usize, String, Option<String>)> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.outcome.is_none())
        .map(|(i, e)| (i, e.situation_id.clone(), e.response_id.clone()))
        .collect();

    let mut report = ResolutionReport {
        requested: pending.len(),
        ..ResolutionReport::default()
    };

    let mut results: Vec<(usize, Result<CachedEvaluation, OracleError>)> = stream::iter(pending)
        .map(|(i, situation, response)| async move {
            let result = match response {
                Some(r) => oracle.evaluate(&situation, &r).await,
                None => Err(OracleError::MissingResponse),
            };
            (i, result)
        })
        .buffer_unordered(cfg.oracle_concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(i, _)| *i);
    for (i, result) in results {
        let event = &mut events[i];
        match result {
            Ok(eval) => {
                event.outcome = Some(eval.error_magnitude);
                report.resolved += 1;
            }
            Err(err) => {
                warn!(
                    actor = %event.actor_id,
                    situation = %event.situation_id,
                    error = %err,
                    "outcome unavailable, leaving gap"
                );
                report.gaps.push(OutcomeGap {
                    index: i,
                    actor_id: event.actor_id.clone(),
                    situation_id: event.situation_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    debug!(requested = report.requested, resolved = report.resolved, "outcome resolution finished");
    (events, report)
}
