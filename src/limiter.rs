use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Admission interface consumed by the dispatcher.
///
/// Implementations track a coupled requests-per-minute / tokens-per-minute
/// budget. The dispatcher only *queries* the limiter; it never debits it.
/// The downstream caller consumes the budget when it actually issues the LLM
/// call, which keeps the at-least-once semantics honest: a caller that dies
/// before calling out is never charged.
///
/// The limiter is supplied per `dequeue` invocation, so different callers can
/// apply different tenants' budgets against one queue.
pub trait RateLimiter: Send + Sync {
    /// Non-blocking admission query for a request of the given estimated
    /// token cost.
    fn can_process(&self, estimated_tokens: u32) -> Result<RateDecision, DispatchError>;

    /// Snapshot of the limiter's current budget, fed into scoring.
    fn metrics(&self) -> Result<RateLimiterMetrics, DispatchError>;
}

/// Outcome of an admission query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    /// Whether the request may be released now.
    pub allowed: bool,

    /// Which axis denied the request, when `allowed` is false.
    pub reason: Option<DenyReason>,

    /// Hint: milliseconds until the request could be admitted.
    pub available_in_ms: Option<u64>,

    /// Remaining budget on both axes at query time.
    pub available: AvailableTokens,
}

impl RateDecision {
    /// An unconditional admission with the given remaining budget.
    pub fn allow(rpm: u32, tpm: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            available_in_ms: None,
            available: AvailableTokens { rpm, tpm },
        }
    }

    /// A denial on the given axis.
    pub fn deny(reason: DenyReason, rpm: u32, tpm: u32) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            available_in_ms: None,
            available: AvailableTokens { rpm, tpm },
        }
    }
}

/// Axis that denied an admission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RpmLimit,
    TpmLimit,
}

/// Remaining budget on both axes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AvailableTokens {
    pub rpm: u32,
    pub tpm: u32,
}

/// Usage snapshot for one axis of the budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisMetrics {
    pub used: u32,
    pub available: u32,
    pub limit: u32,
    /// Fraction of the limit in use, in [0, 1].
    pub percentage: f64,
}

impl AxisMetrics {
    /// Build an axis snapshot from used/limit, deriving the rest.
    pub fn from_usage(used: u32, limit: u32) -> Self {
        Self {
            used,
            available: limit.saturating_sub(used),
            limit,
            percentage: if limit == 0 {
                0.0
            } else {
                f64::from(used) / f64::from(limit)
            },
        }
    }
}

/// Full limiter snapshot fed into the score calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    pub rpm: AxisMetrics,
    pub tpm: AxisMetrics,

    /// Limiter-reported efficiency of recent consumption, in [0, 1].
    pub efficiency: f64,

    /// Aggregate history of what the limiter has actually charged.
    pub consumption: ConsumptionHistory,
}

/// Aggregate consumption history reported by the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumptionHistory {
    /// Requests charged so far.
    pub count: u64,

    /// Mean tokens per charged request.
    pub average_tokens_per_request: f64,

    /// Total tokens charged.
    pub total_tokens: u64,

    /// Ratio of estimated to actual tokens across charged requests.
    pub estimation_accuracy: f64,
}
