use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::limiter::RateLimiterMetrics;
use crate::metrics::QueueReport;
use crate::types::{MessageScore, Priority, QueueMessage, ScoreBreakdown};

/// Weights applied to each sub-score. Need not sum to 1: the dispatcher's
/// minimum threshold is absolute, not normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub priority: f64,
    pub efficiency: f64,
    pub wait_time: f64,
    pub retry: f64,
    pub token_fit: f64,
    pub processing_time: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority: 0.25,
            efficiency: 0.20,
            wait_time: 0.20,
            retry: 0.10,
            token_fit: 0.15,
            processing_time: 0.10,
        }
    }
}

/// Snapshot handed to the score calculator for one dequeue pass.
///
/// Built once per pass so every candidate is judged against the same budget.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    /// Rate-limiter budget at the start of the pass.
    pub rate: RateLimiterMetrics,

    /// Queue-level metrics at the start of the pass.
    pub queue: QueueReport,

    /// Current time, milliseconds since the Unix epoch.
    pub now_ms: u64,
}

/// User-supplied additive scoring component.
///
/// Scorers must be pure and cheap; they run once per candidate per dequeue.
/// The returned value is multiplied by `weight()` and added to the total
/// without clamping.
pub trait CustomScorer<T>: Send + Sync {
    /// Stable name, used in logs.
    fn name(&self) -> &str;

    /// Weight applied to this scorer's output.
    fn weight(&self) -> f64;

    /// Compute the raw (unweighted) contribution for one candidate.
    fn calculate(&self, message: &QueueMessage<T>, context: &ScoreContext) -> f64;
}

/// Priority sub-score: fixed table, most urgent highest.
pub fn priority_score(priority: Priority) -> f64 {
    match priority {
        Priority::Urgent => 1.0,
        Priority::High => 0.7,
        Priority::Normal => 0.4,
        Priority::Low => 0.1,
    }
}

/// Efficiency sub-score: how well the estimate uses the available TPM budget.
///
/// Peaks in the 70–90% utilization sweet spot, degrades slightly up to 100%,
/// and is zero for anything that cannot fit.
pub fn efficiency_score(estimated: u32, available_tpm: u32) -> f64 {
    if available_tpm == 0 {
        return 0.0;
    }
    let u = f64::from(estimated) / f64::from(available_tpm);
    if u > 1.0 {
        0.0
    } else if u > 0.9 {
        0.9
    } else if u >= 0.7 {
        1.0
    } else {
        u / 0.7
    }
}

/// Wait-time sub-score: fraction of the per-priority target wait, capped at 1.
///
/// Urgent waits ramp on a square-root curve so they saturate faster.
pub fn wait_time_score(wait_ms: u64, priority: Priority) -> f64 {
    let max_wait_ms: u64 = match priority {
        Priority::Urgent => 10_000,
        Priority::High => 30_000,
        Priority::Normal => 60_000,
        Priority::Low => 300_000,
    };
    let s = (wait_ms as f64 / max_wait_ms as f64).min(1.0);
    if priority == Priority::Urgent {
        s.sqrt()
    } else {
        s
    }
}

/// Retry sub-score: rewards fresh messages, floored at 0.1 so a much-retried
/// message can still win eventually.
pub fn retry_penalty(receive_count: u32) -> f64 {
    if receive_count == 0 {
        1.0
    } else {
        0.7_f64.powi(receive_count as i32).max(0.1)
    }
}

/// Token-fit sub-score: mid-sized requests relative to the TPM budget fit
/// best; tiny requests are mildly penalized, oversized ones are zero.
pub fn token_fit_score(estimated: u32, available_tpm: u32) -> f64 {
    if available_tpm == 0 {
        return 0.0;
    }
    let r = f64::from(estimated) / f64::from(available_tpm);
    if r > 1.0 {
        0.0
    } else if r > 0.5 {
        1.0 - 0.4 * (r - 0.5)
    } else if r >= 0.1 {
        1.0
    } else {
        10.0 * r
    }
}

/// Processing-time sub-score: shorter expected work scores higher.
///
/// Falls back to 10 ms per estimated token when the caller supplied no
/// expectation.
pub fn processing_time_score(estimated: u32, expected_ms: Option<u64>) -> f64 {
    let t = expected_ms.unwrap_or(10 * u64::from(estimated)) as f64;
    if t <= 1_000.0 {
        1.0
    } else if t <= 5_000.0 {
        1.0 - 0.3 * (t - 1_000.0) / 4_000.0
    } else if t <= 30_000.0 {
        0.7 - 0.6 * (t - 5_000.0) / 25_000.0
    } else {
        0.1
    }
}

/// Combines the weighted sub-scores and any custom scorers into a total.
pub struct ScoreCalculator<T> {
    weights: ScoringWeights,
    custom: Vec<Arc<dyn CustomScorer<T>>>,
}

impl<T> ScoreCalculator<T> {
    pub fn new(weights: ScoringWeights, custom: Vec<Arc<dyn CustomScorer<T>>>) -> Self {
        Self { weights, custom }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score one candidate against the pass context.
    ///
    /// The breakdown holds weighted contributions; `total` is their sum plus
    /// the weighted output of each custom scorer.
    pub fn score(&self, message: &QueueMessage<T>, context: &ScoreContext) -> MessageScore {
        let wait_ms = context
            .now_ms
            .saturating_sub(message.attributes.enqueued_at_ms);
        let available_tpm = context.rate.tpm.available;
        let estimated = message.estimated_tokens();
        let priority = message.priority();

        let breakdown = ScoreBreakdown {
            priority: self.weights.priority * priority_score(priority),
            efficiency: self.weights.efficiency * efficiency_score(estimated, available_tpm),
            wait_time: self.weights.wait_time * wait_time_score(wait_ms, priority),
            retry: self.weights.retry * retry_penalty(message.attributes.receive_count),
            token_fit: self.weights.token_fit * token_fit_score(estimated, available_tpm),
            processing_time: self.weights.processing_time
                * processing_time_score(estimated, message.request.expected_processing_ms),
        };

        let mut total = breakdown.priority
            + breakdown.efficiency
            + breakdown.wait_time
            + breakdown.retry
            + breakdown.token_fit
            + breakdown.processing_time;

        for scorer in &self.custom {
            total += scorer.weight() * scorer.calculate(message, context);
        }

        MessageScore { total, breakdown }
    }
}

impl<T> fmt::Debug for ScoreCalculator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoreCalculator")
            .field("weights", &self.weights)
            .field(
                "custom",
                &self.custom.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
