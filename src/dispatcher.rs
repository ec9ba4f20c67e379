use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::{BufferAdd, PriorityBuffer};
use crate::error::DispatchError;
use crate::limiter::RateLimiter;
use crate::metrics::{MetricsCollector, QueueReport, DEFAULT_MAX_EVENTS, DEFAULT_RETENTION};
use crate::score::{CustomScorer, ScoreCalculator, ScoreContext, ScoringWeights};
use crate::storage::{InMemoryStorage, QueueAttributes, QueueStorage};
use crate::types::{LlmRequest, MessageId, MessageScore, Priority, QueueMessage};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Buffer fill level below which a non-prefetching dequeue tops up from
/// storage, and the cap on a direct fetch.
const DIRECT_FETCH_LIMIT: usize = 10;

/// Dispatcher tuning knobs.
///
/// `Default` is the balanced profile; see the preset constructors for the
/// named alternatives.
pub struct DispatcherConfig<T> {
    /// Max prefetch buffer capacity.
    pub buffer_size: usize,

    /// Run the periodic prefetch worker.
    pub enable_prefetch: bool,

    /// Period between prefetch ticks.
    pub prefetch_interval: Duration,

    /// Cap on candidates scored per dequeue.
    pub max_candidates_to_evaluate: usize,

    /// Absolute floor for the weighted total; below it, no selection.
    pub min_score_threshold: f64,

    /// In-flight window granted on every storage dequeue.
    pub visibility_timeout: Duration,

    /// Sliding window of the metrics event log.
    pub metrics_retention: Duration,

    /// Cap on retained metric events.
    pub max_metric_events: usize,

    /// Weights for the built-in sub-scores.
    pub weights: ScoringWeights,

    /// Additive user-supplied scorers.
    pub custom_scorers: Vec<Arc<dyn CustomScorer<T>>>,
}

impl<T> Default for DispatcherConfig<T> {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            enable_prefetch: false,
            prefetch_interval: Duration::from_secs(5),
            max_candidates_to_evaluate: 20,
            min_score_threshold: 0.1,
            visibility_timeout: Duration::from_secs(30),
            metrics_retention: DEFAULT_RETENTION,
            max_metric_events: DEFAULT_MAX_EVENTS,
            weights: ScoringWeights::default(),
            custom_scorers: Vec::new(),
        }
    }
}

impl<T> Clone for DispatcherConfig<T> {
    fn clone(&self) -> Self {
        Self {
            buffer_size: self.buffer_size,
            enable_prefetch: self.enable_prefetch,
            prefetch_interval: self.prefetch_interval,
            max_candidates_to_evaluate: self.max_candidates_to_evaluate,
            min_score_threshold: self.min_score_threshold,
            visibility_timeout: self.visibility_timeout,
            metrics_retention: self.metrics_retention,
            max_metric_events: self.max_metric_events,
            weights: self.weights,
            custom_scorers: self.custom_scorers.clone(),
        }
    }
}

impl<T> fmt::Debug for DispatcherConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("buffer_size", &self.buffer_size)
            .field("enable_prefetch", &self.enable_prefetch)
            .field("prefetch_interval", &self.prefetch_interval)
            .field("max_candidates_to_evaluate", &self.max_candidates_to_evaluate)
            .field("min_score_threshold", &self.min_score_threshold)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("weights", &self.weights)
            .field(
                "custom_scorers",
                &self.custom_scorers.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<T> DispatcherConfig<T> {
    /// Set the prefetch buffer capacity.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enable or disable the periodic prefetch worker.
    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.enable_prefetch = enabled;
        self
    }

    /// Set the period between prefetch ticks.
    pub fn with_prefetch_interval(mut self, interval: Duration) -> Self {
        self.prefetch_interval = interval;
        self
    }

    /// Set the cap on candidates scored per dequeue.
    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates_to_evaluate = max;
        self
    }

    /// Set the absolute selection floor.
    pub fn with_min_score_threshold(mut self, threshold: f64) -> Self {
        self.min_score_threshold = threshold;
        self
    }

    /// Set the in-flight window granted on storage dequeues.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the metrics sliding window.
    pub fn with_metrics_retention(mut self, retention: Duration) -> Self {
        self.metrics_retention = retention;
        self
    }

    /// Override the built-in sub-score weights.
    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Register an additive custom scorer.
    pub fn with_custom_scorer(mut self, scorer: Arc<dyn CustomScorer<T>>) -> Self {
        self.custom_scorers.push(scorer);
        self
    }
}

/// Entry in the dispatcher's in-flight index. The release-time limiter
/// travels with the [`ProcessableMessage`] handle instead.
struct InFlightEntry {
    priority: Priority,
    started_at: Instant,
}

/// Point-in-time view of one in-flight delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightSnapshot {
    pub message_id: MessageId,
    pub priority: Priority,
    pub elapsed_ms: u64,
}

/// Composite view returned by [`Dispatcher::queue_metrics`].
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Visible / in-flight counts from storage.
    pub storage: QueueAttributes,

    /// Sliding-window event aggregation.
    pub report: QueueReport,

    /// Deliveries currently held by callers.
    pub in_flight: Vec<InFlightSnapshot>,

    /// Buffer fill fraction, in [0, 1].
    pub buffer_utilization: f64,
}

/// Rate-aware request dispatcher.
///
/// Coordinates the prefetch buffer, the score calculator, the metrics log,
/// and a caller-supplied rate limiter to release the single best admissible
/// message per `dequeue` call under visibility-timeout delivery semantics.
pub struct Dispatcher<T: Clone + Send + Sync + 'static> {
    storage: Arc<dyn QueueStorage<T>>,
    buffer: Arc<Mutex<PriorityBuffer<T>>>,
    in_flight: Arc<Mutex<HashMap<MessageId, InFlightEntry>>>,
    metrics: Arc<MetricsCollector>,
    calculator: ScoreCalculator<T>,
    enable_prefetch: bool,
    max_candidates: usize,
    min_score_threshold: f64,
    visibility_timeout: Duration,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    prefetch_handle: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> Dispatcher<T> {
    /// Create a dispatcher backed by an in-memory queue.
    pub fn new(config: DispatcherConfig<T>) -> Self {
        Self::new_with_storage(Arc::new(InMemoryStorage::new()), config)
    }

    /// Create a dispatcher over the given storage adapter.
    pub fn new_with_storage(
        storage: Arc<dyn QueueStorage<T>>,
        config: DispatcherConfig<T>,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(PriorityBuffer::new(config.buffer_size)));
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics_retention,
            config.max_metric_events,
        ));
        let is_running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let prefetch_handle = if config.enable_prefetch {
            Some(tokio::spawn(prefetch_loop(
                storage.clone(),
                buffer.clone(),
                is_running.clone(),
                shutdown.clone(),
                config.prefetch_interval,
                config.visibility_timeout,
            )))
        } else {
            None
        };

        Self {
            storage,
            buffer,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            calculator: ScoreCalculator::new(config.weights, config.custom_scorers),
            enable_prefetch: config.enable_prefetch,
            max_candidates: config.max_candidates_to_evaluate,
            min_score_threshold: config.min_score_threshold,
            visibility_timeout: config.visibility_timeout,
            is_running,
            shutdown,
            prefetch_handle,
        }
    }

    /// Persist a request. No scoring happens here.
    pub async fn enqueue(&self, request: LlmRequest<T>) -> Result<QueueMessage<T>, DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }
        let message = self.storage.enqueue(request).await?;
        self.metrics
            .record_enqueue(&message.id, message.priority(), message.estimated_tokens());
        metric_inc("llm_dispatcher.enqueued");
        Ok(message)
    }

    /// Persist several requests via the adapter's batch path.
    pub async fn batch_enqueue(
        &self,
        requests: Vec<LlmRequest<T>>,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }
        let messages = self.storage.batch_enqueue(requests).await?;
        for message in &messages {
            self.metrics
                .record_enqueue(&message.id, message.priority(), message.estimated_tokens());
            metric_inc("llm_dispatcher.enqueued");
        }
        Ok(messages)
    }

    /// Release the single best admissible message, if any.
    ///
    /// This path is total: storage or limiter failures degrade to `None`
    /// (with a log line), never an error. `None` also covers an empty queue,
    /// a limiter that denies everything, and a best score below the
    /// configured threshold.
    pub async fn dequeue(&self, limiter: Arc<dyn RateLimiter>) -> Option<ProcessableMessage<T>> {
        if !self.is_running.load(Ordering::SeqCst) {
            return None;
        }

        let (candidates, direct) = self.collect_candidates().await;
        if candidates.is_empty() {
            return None;
        }

        let winner = self.select_candidate(&candidates, limiter.as_ref()).await;

        let winner_id = winner.as_ref().map(|(idx, _)| candidates[*idx].id.clone());
        if direct {
            // Direct-fetch candidates are already in-flight in storage.
            // Release the ones we are not handing out so their receive count
            // stops inflating; expiry reclaims them if the release fails.
            for candidate in &candidates {
                if Some(&candidate.id) != winner_id.as_ref() {
                    release_delivery(self.storage.as_ref(), candidate).await;
                }
            }
        }

        let (idx, score) = winner?;
        let message = candidates.into_iter().nth(idx).expect("winner index in range");
        debug!(
            message_id = %message.id.0,
            priority = ?message.priority(),
            total = score.total,
            "selected candidate"
        );

        self.buffer.lock().await.remove(&message.id);
        self.in_flight.lock().await.insert(
            message.id.clone(),
            InFlightEntry {
                priority: message.priority(),
                started_at: Instant::now(),
            },
        );
        self.metrics.record_dequeue(&message.id);
        metric_inc("llm_dispatcher.dequeued");

        Some(ProcessableMessage {
            message,
            score,
            storage: self.storage.clone(),
            in_flight: self.in_flight.clone(),
            metrics: self.metrics.clone(),
            started_at: Instant::now(),
            limiter,
        })
    }

    /// Gather the candidate set for one dequeue pass. The flag reports
    /// whether the candidates came from a direct storage fetch (and are thus
    /// in-flight without a buffer entry).
    async fn collect_candidates(&self) -> (Vec<QueueMessage<T>>, bool) {
        if !self.enable_prefetch {
            self.top_up_buffer().await;
        }

        let candidates = self
            .buffer
            .lock()
            .await
            .peek_by_priority(self.max_candidates);
        if !candidates.is_empty() {
            return (candidates, false);
        }

        if self.enable_prefetch {
            return (Vec::new(), false);
        }

        // Compatibility path for callers that never enable prefetch and
        // whose top-up could not stage anything.
        match self
            .storage
            .dequeue(DIRECT_FETCH_LIMIT, self.visibility_timeout)
            .await
        {
            Ok(messages) => (messages, true),
            Err(e) => {
                warn!(error = %e, "direct fetch failed");
                (Vec::new(), false)
            }
        }
    }

    /// Best-effort buffer fill used when the prefetch worker is off.
    async fn top_up_buffer(&self) {
        let (len, capacity) = {
            let buffer = self.buffer.lock().await;
            (buffer.len(), buffer.capacity())
        };
        let target = DIRECT_FETCH_LIMIT.min(capacity);
        if len >= target {
            return;
        }

        match self
            .storage
            .dequeue(target - len, self.visibility_timeout)
            .await
        {
            Ok(messages) => {
                stage_messages(self.storage.as_ref(), &self.buffer, messages).await;
            }
            Err(e) => warn!(error = %e, "buffer top-up failed"),
        }
    }

    /// Score admissible candidates and pick the strict maximum.
    ///
    /// Candidates arrive in priority order and the comparison is strict, so
    /// the first-seen candidate wins ties. Returns the winning index and
    /// score, or `None` when nothing is admissible or the best total falls
    /// below the threshold.
    async fn select_candidate(
        &self,
        candidates: &[QueueMessage<T>],
        limiter: &dyn RateLimiter,
    ) -> Option<(usize, MessageScore)> {
        let rate = match limiter.metrics() {
            Ok(rate) => rate,
            Err(e) => {
                warn!(error = %e, "rate limiter metrics unavailable");
                return None;
            }
        };
        let context = ScoreContext {
            rate,
            queue: self.metrics.report(),
            now_ms: crate::types::now_ms(),
        };

        let mut best: Option<(usize, MessageScore)> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let decision = match limiter.can_process(candidate.estimated_tokens()) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(message_id = %candidate.id.0, error = %e, "admission query failed");
                    continue;
                }
            };
            if !decision.allowed {
                debug!(
                    message_id = %candidate.id.0,
                    reason = ?decision.reason,
                    "candidate not admissible"
                );
                continue;
            }

            let score = self.calculator.score(candidate, &context);
            self.buffer.lock().await.update_score(&candidate.id, score.total);
            if best
                .as_ref()
                .map_or(true, |(_, s)| score.total > s.total)
            {
                best = Some((idx, score));
            }
        }

        match best {
            Some((idx, score)) if score.total >= self.min_score_threshold => Some((idx, score)),
            Some((_, score)) => {
                debug!(total = score.total, "best candidate below threshold");
                None
            }
            None => None,
        }
    }

    /// Composite queue / delivery / buffer view.
    pub async fn queue_metrics(&self) -> Result<QueueMetrics, DispatchError> {
        let storage = self.storage.queue_attributes().await?;
        let in_flight = {
            let guard = self.in_flight.lock().await;
            guard
                .iter()
                .map(|(id, entry)| InFlightSnapshot {
                    message_id: id.clone(),
                    priority: entry.priority,
                    elapsed_ms: entry.started_at.elapsed().as_millis() as u64,
                })
                .collect()
        };
        let buffer_utilization = {
            let buffer = self.buffer.lock().await;
            if buffer.capacity() == 0 {
                0.0
            } else {
                buffer.len() as f64 / buffer.capacity() as f64
            }
        };
        Ok(QueueMetrics {
            storage,
            report: self.metrics.report(),
            in_flight,
            buffer_utilization,
        })
    }

    /// Whether the dispatcher accepts work.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Halt the prefetch worker. Outstanding [`ProcessableMessage`] handles
    /// stay valid; unacknowledged deliveries return to visible after their
    /// windows expire.
    pub async fn stop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(handle) = self.prefetch_handle.take() {
            let _ = handle.await;
        }
    }

    /// Stop the worker, drop all local state, and purge storage.
    pub async fn purge(&mut self) -> Result<(), DispatchError> {
        self.stop().await;
        self.buffer.lock().await.clear();
        self.in_flight.lock().await.clear();
        self.storage.purge().await
    }
}

/// Delivery handle returned by [`Dispatcher::dequeue`].
///
/// The caller must resolve it exactly once via [`mark_processed`] or
/// [`mark_failed`]; an unresolved handle returns to visible after its
/// visibility window.
///
/// [`mark_processed`]: ProcessableMessage::mark_processed
/// [`mark_failed`]: ProcessableMessage::mark_failed
pub struct ProcessableMessage<T: Clone + Send + Sync + 'static> {
    message: QueueMessage<T>,
    score: MessageScore,
    storage: Arc<dyn QueueStorage<T>>,
    in_flight: Arc<Mutex<HashMap<MessageId, InFlightEntry>>>,
    metrics: Arc<MetricsCollector>,
    started_at: Instant,
    limiter: Arc<dyn RateLimiter>,
}

impl<T: Clone + Send + Sync + 'static> ProcessableMessage<T> {
    /// The delivered envelope.
    pub fn message(&self) -> &QueueMessage<T> {
        &self.message
    }

    /// The winning score that selected this delivery.
    pub fn score(&self) -> &MessageScore {
        &self.score
    }

    /// Time since this delivery was released.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The limiter supplied at release time. The caller debits it when the
    /// LLM call is actually issued.
    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// Acknowledge success: delete from storage and record completion.
    ///
    /// Storage errors propagate, in particular a stale receipt handle, which
    /// means the visibility window expired and the message may have been
    /// redelivered elsewhere.
    pub async fn mark_processed(self) -> Result<(), DispatchError> {
        let result = self
            .storage
            .delete_message(&self.message.attributes.receipt_handle)
            .await;
        // The entry can never complete twice; drop it even when the delete
        // failed on a stale handle.
        self.in_flight.lock().await.remove(&self.message.id);
        result?;
        self.metrics.record_complete(
            &self.message.id,
            self.started_at.elapsed().as_millis() as u64,
            self.message.estimated_tokens(),
        );
        metric_inc("llm_dispatcher.completed");
        Ok(())
    }

    /// Acknowledge failure: record it and let the visibility window expire so
    /// the message is redelivered with a higher receive count. Storage is
    /// deliberately untouched.
    pub async fn mark_failed(self, error: impl Into<String>) {
        self.in_flight.lock().await.remove(&self.message.id);
        self.metrics.record_failure(&self.message.id, error);
        metric_inc("llm_dispatcher.failed");
    }

    /// Extend or shorten this delivery's visibility window.
    pub async fn update_visibility(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.storage
            .update_visibility_timeout(&self.message.attributes.receipt_handle, timeout)
            .await
    }
}

/// Make a delivery immediately visible again, best effort.
async fn release_delivery<T: Send + Sync + 'static>(
    storage: &dyn QueueStorage<T>,
    message: &QueueMessage<T>,
) {
    if let Err(e) = storage
        .update_visibility_timeout(&message.attributes.receipt_handle, Duration::ZERO)
        .await
    {
        debug!(message_id = %message.id.0, error = %e, "release failed");
    }
}

/// Stage freshly dequeued messages into the buffer, releasing anything the
/// buffer will not hold.
async fn stage_messages<T: Clone + Send + Sync + 'static>(
    storage: &dyn QueueStorage<T>,
    buffer: &Mutex<PriorityBuffer<T>>,
    messages: Vec<QueueMessage<T>>,
) {
    for message in messages {
        let outcome = {
            let mut buffer = buffer.lock().await;
            if buffer.contains(&message.id) {
                // A stale duplicate is sitting in the buffer; replace it with
                // the delivery that holds the current receipt handle.
                buffer.remove(&message.id);
            }
            buffer.add(message.clone(), None)
        };
        match outcome {
            BufferAdd::Added => {}
            BufferAdd::AddedEvicting(evicted) => {
                release_delivery(storage, &evicted).await;
            }
            BufferAdd::Rejected => {
                release_delivery(storage, &message).await;
            }
        }
    }
}

/// Periodic prefetch worker: keeps the buffer full and its entries alive.
///
/// Errors are logged and never terminate the loop.
async fn prefetch_loop<T: Clone + Send + Sync + 'static>(
    storage: Arc<dyn QueueStorage<T>>,
    buffer: Arc<Mutex<PriorityBuffer<T>>>,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    interval: Duration,
    visibility_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if !is_running.load(Ordering::SeqCst) {
            return;
        }
        prefetch_tick(&storage, &buffer, visibility_timeout).await;
    }
}

async fn prefetch_tick<T: Clone + Send + Sync + 'static>(
    storage: &Arc<dyn QueueStorage<T>>,
    buffer: &Arc<Mutex<PriorityBuffer<T>>>,
    visibility_timeout: Duration,
) {
    // Fill whatever room is left.
    let room = {
        let buffer = buffer.lock().await;
        buffer.capacity().saturating_sub(buffer.len())
    };
    if room > 0 {
        match storage.dequeue(room, visibility_timeout).await {
            Ok(messages) => {
                metric_inc("llm_dispatcher.prefetched");
                stage_messages(storage.as_ref(), buffer, messages).await;
            }
            Err(e) => warn!(error = %e, "prefetch fill failed"),
        }
    }

    // Renew every buffered entry so it does not silently expire; drop the
    // ones whose delivery no longer exists.
    let staged = buffer.lock().await.snapshot();
    for message in staged {
        if let Err(e) = storage
            .update_visibility_timeout(&message.attributes.receipt_handle, visibility_timeout)
            .await
        {
            debug!(message_id = %message.id.0, error = %e, "dropping unrenewable buffer entry");
            buffer.lock().await.remove(&message.id);
        }
    }
}
