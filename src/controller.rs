//! Adaptive worker-count policy
//!
//! Every `checkpoint_interval` completed pages the pipeline asks the controller
//! for a new worker count. Load above either threshold sheds one worker,
//! otherwise one is added, always within `[1, ceiling]`.

use crate::monitor::{ResourceMonitor, ResourceSample};
use std::sync::Arc;
use tracing::debug;

/// Utilization limits in percent. A reading equal to its limit is not over it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 80.0,
        }
    }
}

/// Suggest the next worker count from one utilization reading.
///
/// Returns `max(1, current - 1)` when either metric is strictly above its
/// threshold and `current + 1` otherwise. The caller clamps to its ceiling.
pub fn adjust(
    current: usize,
    cpu_percent: f32,
    memory_percent: f32,
    cpu_threshold: f32,
    memory_threshold: f32,
) -> usize {
    if cpu_percent > cpu_threshold || memory_percent > memory_threshold {
        current.saturating_sub(1).max(1)
    } else {
        current + 1
    }
}

/// Result of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub sample: ResourceSample,
    pub current: usize,
    pub suggested: usize,
}

impl Decision {
    pub fn changes(&self) -> bool {
        self.suggested != self.current
    }
}

/// Couples the policy with a monitor, a checkpoint cadence and a ceiling.
pub struct AdaptiveController {
    monitor: Arc<dyn ResourceMonitor>,
    thresholds: Thresholds,
    checkpoint_interval: usize,
    ceiling: usize,
}

impl AdaptiveController {
    pub fn new(
        monitor: Arc<dyn ResourceMonitor>,
        thresholds: Thresholds,
        checkpoint_interval: usize,
        ceiling: usize,
    ) -> Self {
        Self {
            monitor,
            thresholds,
            checkpoint_interval: checkpoint_interval.max(1),
            ceiling: ceiling.max(1),
        }
    }

    /// True after every `checkpoint_interval` completions.
    pub fn is_checkpoint(&self, completed: usize) -> bool {
        completed > 0 && completed % self.checkpoint_interval == 0
    }

    /// Sample the monitor and suggest a worker count within `[1, ceiling]`.
    pub fn evaluate(&self, current: usize) -> Decision {
        let sample = self.monitor.sample();
        let suggested = adjust(
            current,
            sample.cpu_percent,
            sample.memory_percent,
            self.thresholds.cpu_percent,
            self.thresholds.memory_percent,
        )
        .min(self.ceiling);

        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            current,
            suggested,
            "Checkpoint"
        );

        Decision {
            sample,
            current,
            suggested,
        }
    }
}
