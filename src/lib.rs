//! A rate-aware request dispatcher for LLM workloads.
//!
//! This crate provides a **single-process, score-driven, at-least-once**
//! dispatcher intended for embedded usage in front of an LLM worker pool.
//!
//! Clients enqueue requests carrying a priority and an estimated token cost.
//! Each `dequeue` releases the *single best* pending request under a coupled
//! requests-per-minute / tokens-per-minute budget, ranked by a weighted score
//! over priority, wait-time fairness, token fit, retry history, and expected
//! processing time. Released messages are protected by a visibility timeout:
//! they are removed only on explicit acknowledgement, return to visible on
//! expiry, and can be extended by the caller.
//!
//! ## Guarantees
//! - At-least-once delivery
//! - Bounded staging memory (the prefetch buffer)
//! - A total dequeue path: callers get a handle or `None`, never an error
//! - Receipt handles authorize exactly one delivery
//!
//! ## Non-Guarantees
//! - Strict FIFO or global priority ordering
//! - Exactly-once delivery
//! - Cross-process coordination
//! - Durability beyond the storage adapter
//!
//! The rate limiter is a collaborator supplied by the caller per `dequeue`
//! call; this crate consumes its admission contract and never debits it.

mod buffer;
mod dispatcher;
mod error;
mod limiter;
mod metrics;
mod presets;
mod score;
mod storage;
mod types;

pub use buffer::{BufferAdd, PriorityBuffer};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, InFlightSnapshot, ProcessableMessage, QueueMetrics,
};
pub use error::DispatchError;
pub use limiter::{
    AvailableTokens, AxisMetrics, ConsumptionHistory, DenyReason, RateDecision, RateLimiter,
    RateLimiterMetrics,
};
pub use metrics::{MetricsCollector, QueueReport, Throughput};
pub use score::{
    efficiency_score, priority_score, processing_time_score, retry_penalty, token_fit_score,
    wait_time_score, CustomScorer, ScoreCalculator, ScoreContext, ScoringWeights,
};
pub use storage::{InMemoryStorage, QueueAttributes, QueueStorage};
pub use types::{
    LlmRequest, MessageAttributes, MessageId, MessageScore, Priority, QueueMessage, ReceiptHandle,
    RequestId, ScoreBreakdown, TokenInfo,
};
