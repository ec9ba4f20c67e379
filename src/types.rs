use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a request.
///
/// Lower numeric value means more urgent. Selection never guarantees strict
/// priority order; priority is one weighted input to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// All priorities, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric rank used for ordering (0 = most urgent).
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Token accounting for a request.
///
/// `estimated` drives admission and scoring; `actual` may be filled in by the
/// caller after the LLM call completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Estimated token cost. Must be positive.
    pub estimated: u32,

    /// Actual token cost, if known after the fact.
    pub actual: Option<u32>,

    /// Target model identifier.
    pub model: Option<String>,
}

impl TokenInfo {
    pub fn new(estimated: u32) -> Self {
        Self {
            estimated,
            actual: None,
            model: None,
        }
    }
}

/// Client-supplied unit of work.
///
/// The dispatcher treats the payload as opaque. Serialization and schema
/// management are the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest<T> {
    /// Stable client identifier for the request.
    pub id: RequestId,

    /// Caller-defined payload, handed back untouched at dequeue.
    pub payload: T,

    /// Scheduling priority.
    pub priority: Priority,

    /// Token accounting used for admission and scoring.
    pub token_info: TokenInfo,

    /// Expected processing time in milliseconds, if the caller knows it.
    pub expected_processing_ms: Option<u64>,

    /// Free-form metadata carried alongside the payload.
    pub metadata: HashMap<String, String>,

    /// Creation timestamp, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl<T> LlmRequest<T> {
    /// Create a new request with the given ID, payload, and token estimate.
    ///
    /// Defaults:
    /// - priority: `Normal`
    /// - no expected processing time
    /// - empty metadata
    pub fn new(id: impl Into<String>, payload: T, estimated_tokens: u32) -> Self {
        Self {
            id: RequestId(id.into()),
            payload,
            priority: Priority::Normal,
            token_info: TokenInfo::new(estimated_tokens),
            expected_processing_ms: None,
            metadata: HashMap::new(),
            created_at_ms: now_ms(),
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the target model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.token_info.model = Some(model.into());
        self
    }

    /// Set the expected processing time in milliseconds.
    pub fn with_expected_processing_ms(mut self, ms: u64) -> Self {
        self.expected_processing_ms = Some(ms);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Storage-assigned delivery bookkeeping for a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAttributes {
    /// Storage-scoped message identifier.
    pub message_id: MessageId,

    /// Opaque token authorizing delete/extend for the current delivery.
    /// Revoked and reissued on every redelivery.
    pub receipt_handle: ReceiptHandle,

    /// Insertion timestamp, milliseconds since the Unix epoch. Set once.
    pub enqueued_at_ms: u64,

    /// Number of times the message has been handed out. Monotonic.
    pub receive_count: u32,

    /// Timestamp of the first delivery, if any.
    pub first_received_at_ms: Option<u64>,
}

/// Storage envelope around a client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage<T> {
    /// Storage-scoped identifier, equal to `attributes.message_id`.
    pub id: MessageId,

    /// The wrapped client request.
    pub request: LlmRequest<T>,

    /// Delivery bookkeeping.
    pub attributes: MessageAttributes,
}

impl<T> QueueMessage<T> {
    /// Scheduling priority of the wrapped request.
    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    /// Estimated token cost of the wrapped request.
    pub fn estimated_tokens(&self) -> u32 {
        self.request.token_info.estimated
    }
}

/// Stable client identifier for a request.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of request IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

/// Storage-scoped identifier for a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a fresh, time-ordered message ID.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Opaque token authorizing delete/extend for exactly one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Generate a fresh receipt handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Weighted score of a candidate, with per-component contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageScore {
    /// Weighted total used for ranking.
    pub total: f64,

    /// Weighted contribution of each component. Sums to `total` minus any
    /// custom-scorer contributions.
    pub breakdown: ScoreBreakdown,
}

/// Weighted per-component contributions to a message score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub priority: f64,
    pub efficiency: f64,
    pub wait_time: f64,
    pub retry: f64,
    pub token_fit: f64,
    pub processing_time: f64,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
