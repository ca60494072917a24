//! Per-actor trailing latency baseline.
//!
//! The baseline is an explicit value threaded through an ordered pass over
//! each actor's events. Every observation bumps the version, and the
//! classifier only ever sees an immutable [`BaselineSnapshot`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::event::DecisionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    /// Trailing mean latency, `None` while the history is too short.
    pub mean: Option<f64>,
    pub samples: usize,
    pub version: u64,
}

impl BaselineSnapshot {
    /// `latency / mean`, or 1.0 when the mean is undefined.
    pub fn normalize(&self, latency: f64) -> f64 {
        match self.mean {
            Some(m) if m > 0.0 => latency / m,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActorBaseline {
    window: VecDeque<f64>,
    capacity: usize,
    min_history: usize,
    version: u64,
}

impl ActorBaseline {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(cfg.baseline_window),
            capacity: cfg.baseline_window,
            min_history: cfg.baseline_min_history,
            version: 0,
        }
    }

    pub fn snapshot(&self) -> BaselineSnapshot {
        let samples = self.window.len();
        let mean = if samples >= self.min_history {
            // Summed fresh each time so the result does not depend on the
            // order of past evictions.
            Some(self.window.iter().sum::<f64>() / samples as f64)
        } else {
            None
        };
        BaselineSnapshot {
            mean,
            samples,
            version: self.version,
        }
    }

    pub fn observe(&mut self, latency: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(latency);
        self.version += 1;
    }
}

/// Whether an event may feed the baseline. Forced, pre-committed and acutely
/// time-pressured decisions are excluded.
pub fn is_baseline_eligible(event: &DecisionEvent, cfg: &EngineConfig) -> bool {
    !event.is_forced()
        && event.latency_secs >= cfg.precommit_floor_secs
        && !event.time_pressure.is_acute(cfg.time_pressure_floor_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_undefined_until_min_history() {
        let cfg = EngineConfig {
            baseline_window: 4,
            baseline_min_history: 2,
            ..EngineConfig::default()
        };
        let mut b = ActorBaseline::new(&cfg);
        b.observe(4.0);
        assert_eq!(b.snapshot().mean, None);
        assert_eq!(b.snapshot().normalize(8.0), 1.0);
        b.observe(6.0);
        assert_eq!(b.snapshot().mean, Some(5.0));
        assert_eq!(b.snapshot().version, 2);
    }

    #[test]
    fn window_evicts_oldest() {
        let cfg = EngineConfig {
            baseline_window: 2,
            baseline_min_history: 1,
            ..EngineConfig::default()
        };
        let mut b = ActorBaseline::new(&cfg);
        for l in [100.0, 2.0, 4.0] {
            b.observe(l);
        }
        assert_eq!(b.snapshot().mean, Some(3.0));
    }
}
