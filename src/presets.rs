//! Named configuration profiles built on the same core.

use crate::dispatcher::DispatcherConfig;
use crate::score::ScoringWeights;

impl<T> DispatcherConfig<T> {
    /// Near-strict priority ordering: the priority weight dominates and
    /// token-shape components are ignored.
    pub fn simple_priority() -> Self {
        Self::default().with_weights(ScoringWeights {
            priority: 0.80,
            efficiency: 0.05,
            wait_time: 0.10,
            retry: 0.05,
            token_fit: 0.0,
            processing_time: 0.0,
        })
    }

    /// Maximize budget utilization: token-shape components dominate, with a
    /// large prefetched candidate pool to pick from.
    pub fn throughput() -> Self {
        Self::default()
            .with_weights(ScoringWeights {
                priority: 0.15,
                efficiency: 0.35,
                wait_time: 0.10,
                retry: 0.05,
                token_fit: 0.25,
                processing_time: 0.10,
            })
            .with_prefetch(true)
            .with_buffer_size(200)
            .with_max_candidates(50)
    }

    /// Wait-time fairness first: long-waiting and much-retried messages catch
    /// up quickly.
    pub fn fair() -> Self {
        Self::default().with_weights(ScoringWeights {
            priority: 0.20,
            efficiency: 0.10,
            wait_time: 0.50,
            retry: 0.15,
            token_fit: 0.05,
            processing_time: 0.0,
        })
    }

    /// Default weights with the prefetch worker on and a widened buffer.
    pub fn prefetching() -> Self {
        Self::default().with_prefetch(true).with_buffer_size(100)
    }
}
