use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::DispatchError;
use crate::types::{
    now_ms, LlmRequest, MessageAttributes, MessageId, Priority, QueueMessage, ReceiptHandle,
};

/// Counts reported by [`QueueStorage::queue_attributes`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueAttributes {
    /// Messages currently eligible for dequeue.
    pub visible: usize,

    /// Messages inside an unexpired visibility window, when the adapter
    /// tracks them.
    pub in_flight: Option<usize>,
}

/// Persistence contract the dispatcher requires of a queue backend.
///
/// Adapters own the persisted message records and must be internally
/// thread-safe. No ordering guarantee across priorities is required;
/// ordering is the dispatcher's job via scoring.
#[async_trait]
pub trait QueueStorage<T: Send + Sync + 'static>: Send + Sync {
    /// Persist a request as a new, immediately visible message.
    ///
    /// Assigns the message ID, the initial receipt handle, the enqueue
    /// timestamp, and a zero receive count.
    async fn enqueue(&self, request: LlmRequest<T>) -> Result<QueueMessage<T>, DispatchError>;

    /// Return up to `limit` visible messages, atomically moving each into the
    /// in-flight state for `visibility_timeout`.
    ///
    /// For every returned message: a fresh receipt handle is issued (revoking
    /// the prior one), the receive count is incremented, and the
    /// first-received timestamp is set if unset. Messages whose prior
    /// visibility window has expired count as visible again.
    async fn dequeue(
        &self,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError>;

    /// Remove a message, keyed on its current receipt handle.
    async fn delete_message(&self, handle: &ReceiptHandle) -> Result<(), DispatchError>;

    /// Extend or shorten the in-flight window of a delivery. A zero timeout
    /// makes the message immediately visible again.
    async fn update_visibility_timeout(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), DispatchError>;

    /// Count of currently visible messages (expired in-flight included).
    async fn approximate_message_count(&self) -> Result<usize, DispatchError>;

    /// Non-consuming read of up to `limit` visible messages with the given
    /// priority.
    async fn peek_by_priority(
        &self,
        priority: Priority,
        limit: usize,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError>;

    /// Enqueue several requests. The default runs them sequentially; adapters
    /// with a native batch API should override.
    async fn batch_enqueue(
        &self,
        requests: Vec<LlmRequest<T>>,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.enqueue(request).await?);
        }
        Ok(out)
    }

    /// Delete several messages. The default runs them sequentially.
    async fn batch_delete(&self, handles: &[ReceiptHandle]) -> Result<(), DispatchError> {
        for handle in handles {
            self.delete_message(handle).await?;
        }
        Ok(())
    }

    /// Visible and (where tracked) in-flight counts.
    async fn queue_attributes(&self) -> Result<QueueAttributes, DispatchError> {
        Ok(QueueAttributes {
            visible: self.approximate_message_count().await?,
            in_flight: None,
        })
    }

    /// Drop every message. Adapters that cannot support this return an error.
    async fn purge(&self) -> Result<(), DispatchError> {
        Err(DispatchError::storage("purge not supported by this adapter"))
    }
}

struct StoredRecord<T> {
    message: QueueMessage<T>,
    /// In-flight until this deadline; `None` means visible.
    visibility_deadline: Option<Instant>,
}

impl<T> StoredRecord<T> {
    fn is_visible(&self, now: Instant) -> bool {
        match self.visibility_deadline {
            None => true,
            Some(deadline) => deadline <= now,
        }
    }
}

struct StorageInner<T> {
    records: HashMap<MessageId, StoredRecord<T>>,
    /// Current receipt handle for each live record. Old handles are removed
    /// when a redelivery issues a new one.
    handles: HashMap<ReceiptHandle, MessageId>,
    /// Insertion order of live records, for stable scans.
    order: Vec<MessageId>,
}

/// In-memory reference implementation of [`QueueStorage`].
///
/// Suitable for tests and single-process deployments; everything is lost on
/// drop.
pub struct InMemoryStorage<T> {
    inner: Mutex<StorageInner<T>>,
}

impl<T> InMemoryStorage<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StorageInner {
                records: HashMap::new(),
                handles: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StorageInner<T> {
    /// Flip expired in-flight records back to visible. The stale receipt
    /// handle stays valid until the next redelivery revokes it.
    fn reap_expired(&mut self, now: Instant) {
        for record in self.records.values_mut() {
            if matches!(record.visibility_deadline, Some(d) if d <= now) {
                record.visibility_deadline = None;
            }
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> QueueStorage<T> for InMemoryStorage<T> {
    async fn enqueue(&self, request: LlmRequest<T>) -> Result<QueueMessage<T>, DispatchError> {
        let id = MessageId::generate();
        let handle = ReceiptHandle::generate();
        let message = QueueMessage {
            id: id.clone(),
            attributes: MessageAttributes {
                message_id: id.clone(),
                receipt_handle: handle.clone(),
                enqueued_at_ms: now_ms(),
                receive_count: 0,
                first_received_at_ms: None,
            },
            request,
        };

        let mut inner = self.inner.lock().await;
        inner.handles.insert(handle, id.clone());
        inner.order.push(id.clone());
        inner.records.insert(
            id,
            StoredRecord {
                message: message.clone(),
                visibility_deadline: None,
            },
        );
        Ok(message)
    }

    async fn dequeue(
        &self,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.reap_expired(now);

        if limit == 0 {
            return Ok(Vec::new());
        }

        let chosen: Vec<MessageId> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .records
                    .get(id)
                    .is_some_and(|r| r.visibility_deadline.is_none())
            })
            .take(limit)
            .cloned()
            .collect();

        let mut delivered = Vec::with_capacity(chosen.len());
        for id in chosen {
            let fresh = ReceiptHandle::generate();
            let record = inner
                .records
                .get_mut(&id)
                .expect("chosen id must be live");
            let old = std::mem::replace(&mut record.message.attributes.receipt_handle, fresh.clone());
            record.message.attributes.receive_count += 1;
            record
                .message
                .attributes
                .first_received_at_ms
                .get_or_insert_with(now_ms);
            record.visibility_deadline = Some(now + visibility_timeout);
            delivered.push(record.message.clone());

            inner.handles.remove(&old);
            inner.handles.insert(fresh, id);
        }
        Ok(delivered)
    }

    async fn delete_message(&self, handle: &ReceiptHandle) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.handles.remove(handle) else {
            return Err(DispatchError::HandleNotFound {
                handle: handle.clone(),
            });
        };
        inner.records.remove(&id);
        inner.order.retain(|existing| existing != &id);
        Ok(())
    }

    async fn update_visibility_timeout(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.handles.get(handle).cloned() else {
            return Err(DispatchError::HandleNotFound {
                handle: handle.clone(),
            });
        };
        let now = Instant::now();
        let record = inner
            .records
            .get_mut(&id)
            .expect("handle map points at a live record");
        record.visibility_deadline = if timeout.is_zero() {
            None
        } else {
            Some(now + timeout)
        };
        Ok(())
    }

    async fn approximate_message_count(&self) -> Result<usize, DispatchError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .records
            .values()
            .filter(|r| r.is_visible(now))
            .count())
    }

    async fn peek_by_priority(
        &self,
        priority: Priority,
        limit: usize,
    ) -> Result<Vec<QueueMessage<T>>, DispatchError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.is_visible(now) && r.message.priority() == priority)
            .take(limit)
            .map(|r| r.message.clone())
            .collect())
    }

    async fn queue_attributes(&self) -> Result<QueueAttributes, DispatchError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let visible = inner
            .records
            .values()
            .filter(|r| r.is_visible(now))
            .count();
        Ok(QueueAttributes {
            visible,
            in_flight: Some(inner.records.len() - visible),
        })
    }

    async fn purge(&self) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        inner.records.clear();
        inner.handles.clear();
        inner.order.clear();
        Ok(())
    }
}
