use std::sync::Arc;
use std::time::Duration;

use llm_dispatcher::{
    AxisMetrics, ConsumptionHistory, DenyReason, DispatchError, Dispatcher, DispatcherConfig,
    InMemoryStorage, LlmRequest, MessageAttributes, MessageId, Priority, PriorityBuffer,
    QueueMessage, QueueStorage, RateDecision, RateLimiter, RateLimiterMetrics, ReceiptHandle,
    ScoringWeights,
};

/// Configurable limiter stub: a fixed RPM/TPM budget, optionally denying
/// everything outright.
struct StubLimiter {
    rpm_limit: u32,
    rpm_used: u32,
    tpm_limit: u32,
    tpm_used: u32,
    deny_all: bool,
}

impl StubLimiter {
    fn with_budget(rpm: u32, tpm: u32) -> Self {
        Self {
            rpm_limit: rpm,
            rpm_used: 0,
            tpm_limit: tpm,
            tpm_used: 0,
            deny_all: false,
        }
    }

    fn deny_all() -> Self {
        Self {
            rpm_limit: 0,
            rpm_used: 0,
            tpm_limit: 0,
            tpm_used: 0,
            deny_all: true,
        }
    }

    fn tpm_available(&self) -> u32 {
        self.tpm_limit.saturating_sub(self.tpm_used)
    }

    fn rpm_available(&self) -> u32 {
        self.rpm_limit.saturating_sub(self.rpm_used)
    }
}

impl RateLimiter for StubLimiter {
    fn can_process(&self, estimated_tokens: u32) -> Result<RateDecision, DispatchError> {
        if self.deny_all || self.rpm_available() == 0 {
            return Ok(RateDecision::deny(
                DenyReason::RpmLimit,
                self.rpm_available(),
                self.tpm_available(),
            ));
        }
        if estimated_tokens > self.tpm_available() {
            return Ok(RateDecision::deny(
                DenyReason::TpmLimit,
                self.rpm_available(),
                self.tpm_available(),
            ));
        }
        Ok(RateDecision::allow(
            self.rpm_available(),
            self.tpm_available(),
        ))
    }

    fn metrics(&self) -> Result<RateLimiterMetrics, DispatchError> {
        Ok(RateLimiterMetrics {
            rpm: AxisMetrics::from_usage(self.rpm_used, self.rpm_limit),
            tpm: AxisMetrics::from_usage(self.tpm_used, self.tpm_limit),
            efficiency: 1.0,
            consumption: ConsumptionHistory::default(),
        })
    }
}

fn request(id: &str, priority: Priority, tokens: u32) -> LlmRequest<String> {
    LlmRequest::new(id, format!("payload-{id}"), tokens).with_priority(priority)
}

#[tokio::test]
async fn priority_wins_when_budget_is_unconstrained() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    dispatcher
        .enqueue(request("low", Priority::Low, 100))
        .await
        .unwrap();
    dispatcher
        .enqueue(request("urgent", Priority::Urgent, 100))
        .await
        .unwrap();
    dispatcher
        .enqueue(request("normal", Priority::Normal, 100))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(20, 2_000));
    let released = dispatcher.dequeue(limiter).await.expect("a selection");

    assert_eq!(released.message().request.id.0, "urgent");
    assert_eq!(released.message().priority(), Priority::Urgent);
    assert_eq!(released.message().attributes.receive_count, 1);
}

#[tokio::test]
async fn tpm_starvation_blocks_oversized_and_prefers_best_fit() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    dispatcher
        .enqueue(request("small", Priority::Normal, 50))
        .await
        .unwrap();
    dispatcher
        .enqueue(request("perfect", Priority::Normal, 800))
        .await
        .unwrap();
    dispatcher
        .enqueue(request("large", Priority::Normal, 1_200))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(20, 1_000));
    let decision = limiter.can_process(1_200).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::TpmLimit));

    let released = dispatcher.dequeue(limiter).await.expect("a selection");
    assert_eq!(released.message().request.id.0, "perfect");
}

#[tokio::test]
async fn failed_delivery_is_redelivered_with_retry_penalty() {
    let config = DispatcherConfig::default().with_visibility_timeout(Duration::from_secs(1));
    let dispatcher = Dispatcher::new(config);
    dispatcher
        .enqueue(request("flaky", Priority::Normal, 100))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(20, 2_000));
    let first = dispatcher.dequeue(limiter.clone()).await.expect("a selection");
    assert_eq!(first.message().attributes.receive_count, 1);
    let first_handle = first.message().attributes.receipt_handle.clone();
    first.mark_failed("worker blew up").await;

    // Nothing is visible until the visibility window expires.
    assert!(dispatcher.dequeue(limiter.clone()).await.is_none());
    tokio::time::sleep(Duration::from_millis(1_300)).await;

    let second = dispatcher.dequeue(limiter).await.expect("redelivery");
    assert_eq!(second.message().attributes.receive_count, 2);
    assert_ne!(second.message().attributes.receipt_handle, first_handle);
    // Two deliveries: raw retry penalty is 0.49, so the weighted
    // contribution sits at or below 0.7 * weight.
    let retry_weight = ScoringWeights::default().retry;
    assert!(second.score().breakdown.retry <= 0.7 * retry_weight + 1e-9);

    second.mark_processed().await.unwrap();
}

#[tokio::test]
async fn high_threshold_suppresses_selection() {
    let config = DispatcherConfig::default().with_min_score_threshold(0.9);
    let dispatcher = Dispatcher::new(config);
    dispatcher
        .enqueue(request("low", Priority::Low, 100))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(20, 2_000));
    assert!(limiter.can_process(100).unwrap().allowed);
    assert!(dispatcher.dequeue(limiter).await.is_none());
}

#[tokio::test]
async fn priority_focused_profile_beats_efficiency() {
    let config = DispatcherConfig::default().with_weights(ScoringWeights {
        priority: 0.9,
        efficiency: 0.02,
        wait_time: 0.02,
        retry: 0.02,
        token_fit: 0.02,
        processing_time: 0.02,
    });
    let dispatcher = Dispatcher::new(config);

    // `low` fits the budget beautifully; `urgent` wastes it. Priority still
    // has to win under this profile.
    dispatcher
        .enqueue(request("low", Priority::Low, 800))
        .await
        .unwrap();
    dispatcher
        .enqueue(request("urgent", Priority::Urgent, 50))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(20, 1_000));
    let released = dispatcher.dequeue(limiter).await.expect("a selection");
    assert_eq!(released.message().request.id.0, "urgent");
}

#[test]
fn full_buffer_evicts_only_for_strictly_higher_priority() {
    let mut buffer: PriorityBuffer<String> = PriorityBuffer::new(5);
    for n in 0..5 {
        let outcome = buffer.add(buffered_message(&format!("n{n}"), Priority::Normal), None);
        assert!(outcome.accepted());
    }

    let rejected = buffer.add(buffered_message("low", Priority::Low), None);
    assert!(!rejected.accepted());
    assert_eq!(buffer.len(), 5);

    let accepted = buffer.add(buffered_message("urgent", Priority::Urgent), None);
    assert!(accepted.accepted());
    assert_eq!(buffer.len(), 5);
    let staged: Vec<Priority> = buffer.snapshot().iter().map(|m| m.priority()).collect();
    assert_eq!(staged.iter().filter(|p| **p == Priority::Normal).count(), 4);
    assert!(staged.contains(&Priority::Urgent));
}

#[tokio::test]
async fn denying_limiter_keeps_everything_queued() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    for n in 0..5 {
        dispatcher
            .enqueue(request(&format!("m{n}"), Priority::Normal, 100))
            .await
            .unwrap();
    }

    let limiter = Arc::new(StubLimiter::deny_all());
    for _ in 0..3 {
        assert!(dispatcher.dequeue(limiter.clone()).await.is_none());
    }

    let metrics = dispatcher.queue_metrics().await.unwrap();
    assert!(metrics.in_flight.is_empty(), "nothing may go in-flight");
    let total = metrics.storage.visible + metrics.storage.in_flight.unwrap_or(0);
    assert_eq!(total, 5, "all messages remain in storage");
}

#[tokio::test]
async fn storage_count_is_conserved_across_acks() {
    let config = DispatcherConfig::default().with_visibility_timeout(Duration::from_secs(1));
    let dispatcher = Dispatcher::new(config);
    for n in 0..5 {
        dispatcher
            .enqueue(request(&format!("m{n}"), Priority::Normal, 100))
            .await
            .unwrap();
    }

    let limiter = Arc::new(StubLimiter::with_budget(100, 10_000));
    for _ in 0..2 {
        let released = dispatcher
            .dequeue(limiter.clone())
            .await
            .expect("a selection");
        released.mark_processed().await.unwrap();
    }

    // After the staging windows expire, exactly enqueues - acks remain.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    let metrics = dispatcher.queue_metrics().await.unwrap();
    assert_eq!(metrics.storage.visible, 3);
}

#[tokio::test]
async fn every_delivery_carries_a_fresh_handle() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    for n in 0..3 {
        dispatcher
            .enqueue(request(&format!("m{n}"), Priority::Normal, 100))
            .await
            .unwrap();
    }

    let limiter = Arc::new(StubLimiter::with_budget(100, 10_000));
    let mut seen_handles = Vec::new();
    for _ in 0..3 {
        let released = dispatcher
            .dequeue(limiter.clone())
            .await
            .expect("a selection");
        let handle = released.message().attributes.receipt_handle.clone();
        assert!(released.message().attributes.receive_count >= 1);
        assert!(!seen_handles.contains(&handle));
        seen_handles.push(handle);
        released.mark_processed().await.unwrap();
    }
}

#[tokio::test]
async fn second_ack_on_same_delivery_fails() {
    let storage: Arc<InMemoryStorage<String>> = Arc::new(InMemoryStorage::new());
    let dispatcher = Dispatcher::new_with_storage(storage.clone(), DispatcherConfig::default());
    dispatcher
        .enqueue(request("once", Priority::Normal, 100))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(100, 10_000));
    let released = dispatcher.dequeue(limiter).await.expect("a selection");
    let handle = released.message().attributes.receipt_handle.clone();
    released.mark_processed().await.unwrap();

    // The delete revoked the handle; acknowledging twice is a caller bug and
    // the second attempt surfaces as not-found.
    let err = storage.delete_message(&handle).await;
    assert!(matches!(err, Err(DispatchError::HandleNotFound { .. })));
}

#[tokio::test]
async fn prefetch_worker_stages_and_renews() {
    let config = DispatcherConfig::default()
        .with_prefetch(true)
        .with_prefetch_interval(Duration::from_millis(50))
        .with_visibility_timeout(Duration::from_millis(400));
    let mut dispatcher = Dispatcher::new(config);

    for n in 0..4 {
        dispatcher
            .enqueue(request(&format!("m{n}"), Priority::Normal, 100))
            .await
            .unwrap();
    }

    // Let several ticks pass, more than the visibility timeout, so staying
    // staged proves the worker renews its entries.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let metrics = dispatcher.queue_metrics().await.unwrap();
    assert!(metrics.buffer_utilization > 0.0, "worker staged messages");
    assert_eq!(metrics.storage.visible, 0, "staged messages stay in-flight");

    // Dequeues are served straight from the buffer.
    let limiter = Arc::new(StubLimiter::with_budget(100, 10_000));
    let released = dispatcher.dequeue(limiter).await.expect("a selection");
    released.mark_processed().await.unwrap();

    dispatcher.stop().await;
}

#[tokio::test]
async fn update_visibility_extends_a_delivery() {
    let config = DispatcherConfig::default().with_visibility_timeout(Duration::from_millis(300));
    let dispatcher = Dispatcher::new(config);
    dispatcher
        .enqueue(request("held", Priority::Normal, 100))
        .await
        .unwrap();

    let limiter = Arc::new(StubLimiter::with_budget(100, 10_000));
    let released = dispatcher
        .dequeue(limiter.clone())
        .await
        .expect("a selection");
    released
        .update_visibility(Duration::from_secs(30))
        .await
        .unwrap();

    // Past the original window, the extension keeps the message hidden.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(dispatcher.dequeue(limiter).await.is_none());

    released.mark_processed().await.unwrap();
}

fn buffered_message(id: &str, priority: Priority) -> QueueMessage<String> {
    let mid = MessageId(id.to_string());
    let request = request(id, priority, 100);
    QueueMessage {
        id: mid.clone(),
        attributes: MessageAttributes {
            message_id: mid,
            receipt_handle: ReceiptHandle::generate(),
            enqueued_at_ms: request.created_at_ms,
            receive_count: 1,
            first_received_at_ms: None,
        },
        request,
    }
}
