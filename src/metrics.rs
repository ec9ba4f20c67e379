use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{now_ms, MessageId, Priority};

/// Default sliding window for the event log.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Default cap on retained events.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone)]
enum EventKind {
    Enqueue { priority: Priority, tokens: u32 },
    Dequeue,
    Complete { processing_ms: u64, tokens: u32 },
    Failure { error: String },
}

#[derive(Debug, Clone)]
struct Event {
    at_ms: u64,
    message_id: MessageId,
    kind: EventKind,
}

/// Append-only event log with sliding-window aggregation.
///
/// Retention is both time-bounded and count-bounded; cleanup is opportunistic
/// on insert once the log grows past 120% of the cap. The report is strictly
/// derived from the log; there is no other state.
#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    events: VecDeque<Event>,
    retention: Duration,
    max_events: usize,
}

impl MetricsCollector {
    pub fn new(retention: Duration, max_events: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                retention,
                max_events,
            }),
        }
    }

    pub fn record_enqueue(&self, message_id: &MessageId, priority: Priority, tokens: u32) {
        self.push(message_id, EventKind::Enqueue { priority, tokens });
    }

    pub fn record_dequeue(&self, message_id: &MessageId) {
        self.push(message_id, EventKind::Dequeue);
    }

    pub fn record_complete(&self, message_id: &MessageId, processing_ms: u64, tokens: u32) {
        self.push(
            message_id,
            EventKind::Complete {
                processing_ms,
                tokens,
            },
        );
    }

    pub fn record_failure(&self, message_id: &MessageId, error: impl Into<String>) {
        self.push(
            message_id,
            EventKind::Failure {
                error: error.into(),
            },
        );
    }

    fn push(&self, message_id: &MessageId, kind: EventKind) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.events.push_back(Event {
            at_ms: now_ms(),
            message_id: message_id.clone(),
            kind,
        });

        // Opportunistic cleanup past 120% of the cap.
        if inner.events.len() * 10 > inner.max_events * 12 {
            let cutoff = now_ms().saturating_sub(inner.retention.as_millis() as u64);
            inner.events.retain(|e| e.at_ms >= cutoff);
            while inner.events.len() > inner.max_events {
                inner.events.pop_front();
            }
        }
    }

    /// Derive the current report from events inside the retention window.
    pub fn report(&self) -> QueueReport {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let now = now_ms();
        let cutoff = now.saturating_sub(inner.retention.as_millis() as u64);
        let minute_cutoff = now.saturating_sub(60_000);

        let mut total_messages = 0usize;
        let mut by_priority: HashMap<Priority, usize> = HashMap::new();
        let mut enqueued_at: HashMap<MessageId, u64> = HashMap::new();
        let mut completed: HashMap<MessageId, u64> = HashMap::new();
        let mut wait_samples: Vec<u64> = Vec::new();
        let mut completes_last_minute = 0usize;
        let mut tokens_last_minute = 0u64;

        for event in inner.events.iter().filter(|e| e.at_ms >= cutoff) {
            match &event.kind {
                EventKind::Enqueue { priority, .. } => {
                    total_messages += 1;
                    *by_priority.entry(*priority).or_default() += 1;
                    enqueued_at.insert(event.message_id.clone(), event.at_ms);
                }
                EventKind::Dequeue => {}
                EventKind::Complete { tokens, .. } => {
                    completed.insert(event.message_id.clone(), event.at_ms);
                    if let Some(start) = enqueued_at.get(&event.message_id) {
                        wait_samples.push(event.at_ms.saturating_sub(*start));
                    }
                    if event.at_ms >= minute_cutoff {
                        completes_last_minute += 1;
                        tokens_last_minute += u64::from(*tokens);
                    }
                }
                EventKind::Failure { .. } => {}
            }
        }

        let oldest_message_age_ms = enqueued_at
            .iter()
            .filter(|(id, _)| !completed.contains_key(*id))
            .map(|(_, at)| now.saturating_sub(*at))
            .max();

        let average_wait_ms = if wait_samples.is_empty() {
            None
        } else {
            Some(wait_samples.iter().sum::<u64>() as f64 / wait_samples.len() as f64)
        };

        QueueReport {
            total_messages,
            by_priority,
            oldest_message_age_ms,
            average_wait_ms,
            throughput: Throughput {
                completes_per_minute: completes_last_minute,
                tokens_per_minute: tokens_last_minute,
            },
        }
    }

    /// Number of retained events. Mostly useful in tests.
    pub fn event_count(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").events.len()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MAX_EVENTS)
    }
}

/// Aggregated view over the retention window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueReport {
    /// Enqueues observed in the window.
    pub total_messages: usize,

    /// Enqueues per priority in the window.
    pub by_priority: HashMap<Priority, usize>,

    /// Age of the oldest enqueued-but-not-completed message, if any.
    pub oldest_message_age_ms: Option<u64>,

    /// Mean enqueue-to-complete latency across matched pairs, if any.
    pub average_wait_ms: Option<f64>,

    /// Rates over the last 60 seconds.
    pub throughput: Throughput,
}

/// Completion rates over the last 60 seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Throughput {
    pub completes_per_minute: usize,

    /// Sum of estimated tokens across completes in the last minute.
    pub tokens_per_minute: u64,
}
