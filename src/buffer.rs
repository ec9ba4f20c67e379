use crate::types::{MessageId, Priority, QueueMessage};

/// Outcome of a buffer insertion.
#[derive(Debug)]
pub enum BufferAdd<T> {
    /// Inserted; the buffer had room.
    Added,

    /// Inserted into a full buffer by evicting the lowest-priority occupant,
    /// returned here so the owner can release its storage delivery.
    AddedEvicting(QueueMessage<T>),

    /// Buffer full and the newcomer does not strictly outrank the lowest
    /// occupant. Ties never evict.
    Rejected,
}

impl<T> BufferAdd<T> {
    /// Whether the message made it into the buffer.
    pub fn accepted(&self) -> bool {
        !matches!(self, BufferAdd::Rejected)
    }
}

struct BufferEntry<T> {
    message: QueueMessage<T>,
    score: Option<f64>,
}

/// Bounded staging area for dequeue candidates, ordered by priority.
///
/// Entries are kept sorted by priority value ascending (most urgent first),
/// stable among equals. Entries are borrowed views of storage records held
/// in-flight by their visibility window; the buffer itself never talks to
/// storage.
pub struct PriorityBuffer<T> {
    entries: Vec<BufferEntry<T>>,
    capacity: usize,
}

impl<T: Clone> PriorityBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Insert a message, optionally with a precomputed score.
    ///
    /// A full buffer accepts only messages that strictly outrank its
    /// lowest-priority occupant, evicting exactly that occupant.
    pub fn add(&mut self, message: QueueMessage<T>, score: Option<f64>) -> BufferAdd<T> {
        if self.entries.len() < self.capacity {
            self.insert_sorted(BufferEntry { message, score });
            return BufferAdd::Added;
        }

        // Sorted ascending by rank: the last entry is the lowest-priority
        // occupant (most recently staged among equals).
        match self.entries.last() {
            Some(last) if message.priority().rank() < last.message.priority().rank() => {
                let evicted = self.entries.pop().expect("non-empty").message;
                self.insert_sorted(BufferEntry { message, score });
                BufferAdd::AddedEvicting(evicted)
            }
            _ => BufferAdd::Rejected,
        }
    }

    fn insert_sorted(&mut self, entry: BufferEntry<T>) {
        let rank = entry.message.priority().rank();
        let at = self
            .entries
            .partition_point(|e| e.message.priority().rank() <= rank);
        self.entries.insert(at, entry);
    }

    /// Remove a message by ID. Returns whether it was present.
    pub fn remove(&mut self, message_id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.message.id != message_id);
        self.entries.len() < before
    }

    /// First `limit` messages in priority order, stable among equals.
    pub fn peek_by_priority(&self, limit: usize) -> Vec<QueueMessage<T>> {
        self.entries
            .iter()
            .take(limit)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Top `limit` scored messages, score descending. Unscored entries are
    /// excluded.
    pub fn peek_by_score(&self, limit: usize) -> Vec<QueueMessage<T>> {
        let mut scored: Vec<(&BufferEntry<T>, f64)> = self
            .entries
            .iter()
            .filter_map(|e| e.score.map(|s| (e, s)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(limit)
            .map(|(e, _)| e.message.clone())
            .collect()
    }

    /// Set or replace the score of a buffered message. Returns whether the
    /// message was present.
    pub fn update_score(&mut self, message_id: &MessageId, score: f64) -> bool {
        for entry in &mut self.entries {
            if &entry.message.id == message_id {
                entry.score = Some(score);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.iter().any(|e| &e.message.id == message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Unordered snapshot of all buffered messages.
    pub fn snapshot(&self) -> Vec<QueueMessage<T>> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LlmRequest, MessageAttributes, ReceiptHandle};

    fn message(id: &str, priority: Priority) -> QueueMessage<u32> {
        let mid = MessageId(id.to_string());
        let request = LlmRequest::new(id, 0u32, 100).with_priority(priority);
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

    #[test]
    fn orders_by_priority_stable_among_equals() {
        let mut buffer = PriorityBuffer::new(10);
        buffer.add(message("n1", Priority::Normal), None);
        buffer.add(message("l1", Priority::Low), None);
        buffer.add(message("u1", Priority::Urgent), None);
        buffer.add(message("n2", Priority::Normal), None);

        let order: Vec<String> = buffer
            .peek_by_priority(10)
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(order, vec!["u1", "n1", "n2", "l1"]);
    }

    #[test]
    fn full_buffer_rejects_equal_or_lower_priority() {
        let mut buffer = PriorityBuffer::new(5);
        for n in 0..5 {
            assert!(buffer
                .add(message(&format!("n{n}"), Priority::Normal), None)
                .accepted());
        }

        assert!(matches!(
            buffer.add(message("low", Priority::Low), None),
            BufferAdd::Rejected
        ));
        // Equal priority ties do not evict either.
        assert!(matches!(
            buffer.add(message("n5", Priority::Normal), None),
            BufferAdd::Rejected
        ));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn full_buffer_evicts_one_lowest_for_higher_priority() {
        let mut buffer = PriorityBuffer::new(5);
        for n in 0..5 {
            buffer.add(message(&format!("n{n}"), Priority::Normal), None);
        }

        let outcome = buffer.add(message("urgent", Priority::Urgent), None);
        let BufferAdd::AddedEvicting(evicted) = outcome else {
            panic!("expected eviction");
        };
        assert_eq!(evicted.priority(), Priority::Normal);
        assert_eq!(buffer.len(), 5);
        assert!(buffer.contains(&MessageId("urgent".into())));
    }

    #[test]
    fn peek_by_score_excludes_unscored() {
        let mut buffer = PriorityBuffer::new(10);
        buffer.add(message("a", Priority::Normal), Some(0.3));
        buffer.add(message("b", Priority::Normal), None);
        buffer.add(message("c", Priority::Normal), Some(0.9));

        let top: Vec<String> = buffer
            .peek_by_score(10)
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(top, vec!["c", "a"]);
    }

    #[test]
    fn update_score_then_rank() {
        let mut buffer = PriorityBuffer::new(10);
        buffer.add(message("a", Priority::Normal), None);
        assert!(buffer.update_score(&MessageId("a".into()), 0.7));
        assert!(!buffer.update_score(&MessageId("missing".into()), 0.7));

        let top = buffer.peek_by_score(1);
        assert_eq!(top[0].id.0, "a");
    }

    #[test]
    fn remove_and_clear() {
        let mut buffer = PriorityBuffer::new(10);
        buffer.add(message("a", Priority::Normal), None);
        buffer.add(message("b", Priority::High), None);

        assert!(buffer.remove(&MessageId("a".into())));
        assert!(!buffer.remove(&MessageId("a".into())));
        assert_eq!(buffer.len(), 1);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let mut buffer = PriorityBuffer::new(0);
        assert!(matches!(
            buffer.add(message("a", Priority::Urgent), None),
            BufferAdd::Rejected
        ));
    }
}
