use ensemble_core::{Prioritized, Priority};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

/// Result of offering an item to a [`PriorityQueue`].
#[derive(Debug)]
pub enum PushOutcome<T> {
    /// The item was appended to its lane.
    Accepted,
    /// The item was appended after evicting the returned victim from the
    /// low or normal lane.
    AcceptedEvicting(Box<T>),
    /// The queue was full of high/urgent/critical entries; the item is
    /// handed back untouched.
    Rejected(Box<T>),
}

struct Lanes<T> {
    // Indexed by `Priority as usize`, Low = 0 .. Critical = 4.
    lanes: [VecDeque<T>; 5],
    size: usize,
}

impl<T> Lanes<T> {
    fn evict_one(&mut self) -> Option<T> {
        for lane in [Priority::Low, Priority::Normal] {
            if let Some(victim) = self.lanes[lane as usize].pop_front() {
                self.size -= 1;
                return Some(victim);
            }
        }
        None
    }
}

/// Bounded buffer with one FIFO lane per [`Priority`] level.
///
/// Consumers always receive the oldest entry of the most urgent non-empty
/// lane. When full, offering a new item evicts the oldest low-priority entry
/// (then the oldest normal-priority entry); high, urgent, and critical
/// entries are never evicted — if only those remain, new items are rejected.
/// All lane mutation happens under a single mutex so the size counter and
/// lane contents stay consistent; waiting consumers are woken through a
/// [`Notify`], with a bounded timeout so shutdown stays responsive.
pub struct PriorityQueue<T> {
    inner: Mutex<Lanes<T>>,
    capacity: usize,
    available: Notify,
}

impl<T: Prioritized> PriorityQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lanes {
                lanes: Default::default(),
                size: 0,
            }),
            capacity,
            available: Notify::new(),
        }
    }

    /// Offers an item, evicting from the low/normal lanes when full.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.size >= self.capacity {
                match inner.evict_one() {
                    Some(victim) => Some(victim),
                    None => return PushOutcome::Rejected(Box::new(item)),
                }
            } else {
                None
            };
            let lane = item.priority() as usize;
            inner.lanes[lane].push_back(item);
            inner.size += 1;
            evicted
        };
        self.available.notify_one();
        match evicted {
            Some(victim) => PushOutcome::AcceptedEvicting(Box::new(victim)),
            None => PushOutcome::Accepted,
        }
    }

    /// Returns an item to the front of its lane, preserving FIFO order.
    ///
    /// Used to hand back work a consumer dequeued but cannot run yet; never
    /// evicts, even if the queue is momentarily over capacity.
    pub fn push_front(&self, item: T) {
        {
            let mut inner = self.inner.lock();
            let lane = item.priority() as usize;
            inner.lanes[lane].push_front(item);
            inner.size += 1;
        }
        self.available.notify_one();
    }

    /// Removes and returns the oldest entry of the most urgent non-empty
    /// lane.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        for priority in Priority::DESCENDING {
            if let Some(item) = inner.lanes[priority as usize].pop_front() {
                inner.size -= 1;
                return Some(item);
            }
        }
        None
    }

    /// Like [`PriorityQueue::pop`], but waits up to `wait` for an item to
    /// arrive before giving up.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        if let Some(item) = self.pop() {
            return Some(item);
        }
        let _ = tokio::time::timeout(wait, self.available.notified()).await;
        self.pop()
    }

    /// Wakes every consumer blocked in [`PriorityQueue::pop_timeout`].
    pub fn wake_consumers(&self) {
        self.available.notify_waiters();
    }

    /// Number of buffered items across all lanes.
    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    /// Whether all lanes are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every buffered item.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for lane in &mut inner.lanes {
            lane.clear();
        }
        inner.size = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_core::Message;

    #[derive(Debug)]
    struct Item {
        label: &'static str,
        priority: Priority,
    }

    impl Item {
        fn new(label: &'static str, priority: Priority) -> Self {
            Self { label, priority }
        }
    }

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.priority
        }
    }

    fn assert_accepted<T>(outcome: PushOutcome<T>) {
        assert!(matches!(outcome, PushOutcome::Accepted));
    }

    #[test]
    fn test_strict_priority_order() {
        let queue = PriorityQueue::new(10);
        assert_accepted(queue.push(Item::new("low", Priority::Low)));
        assert_accepted(queue.push(Item::new("critical", Priority::Critical)));
        assert_accepted(queue.push(Item::new("normal", Priority::Normal)));
        assert_accepted(queue.push(Item::new("urgent", Priority::Urgent)));
        assert_accepted(queue.push(Item::new("high", Priority::High)));

        let order: Vec<&str> = std::iter::from_fn(|| queue.pop()).map(|i| i.label).collect();
        assert_eq!(order, vec!["critical", "urgent", "high", "normal", "low"]);
    }

    #[test]
    fn test_fifo_within_a_lane() {
        let queue = PriorityQueue::new(10);
        assert_accepted(queue.push(Item::new("first", Priority::Normal)));
        assert_accepted(queue.push(Item::new("second", Priority::Normal)));
        assert_accepted(queue.push(Item::new("third", Priority::Normal)));

        assert_eq!(queue.pop().unwrap().label, "first");
        assert_eq!(queue.pop().unwrap().label, "second");
        assert_eq!(queue.pop().unwrap().label, "third");
    }

    #[test]
    fn test_eviction_prefers_low_then_normal() {
        let queue = PriorityQueue::new(2);
        assert_accepted(queue.push(Item::new("normal", Priority::Normal)));
        assert_accepted(queue.push(Item::new("low", Priority::Low)));

        // Low lane has a victim: it goes first.
        match queue.push(Item::new("urgent", Priority::Urgent)) {
            PushOutcome::AcceptedEvicting(victim) => assert_eq!(victim.label, "low"),
            other => panic!("expected eviction, got {other:?}"),
        }
        // Only the normal entry is evictable now.
        match queue.push(Item::new("critical", Priority::Critical)) {
            PushOutcome::AcceptedEvicting(victim) => assert_eq!(victim.label, "normal"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_rejects_when_only_high_priority_remains() {
        let queue = PriorityQueue::new(2);
        assert_accepted(queue.push(Item::new("high", Priority::High)));
        assert_accepted(queue.push(Item::new("critical", Priority::Critical)));

        match queue.push(Item::new("late", Priority::Urgent)) {
            PushOutcome::Rejected(item) => assert_eq!(item.label, "late"),
            other => panic!("expected rejection, got {other:?}"),
        }
        // Contents unchanged.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().label, "critical");
        assert_eq!(queue.pop().unwrap().label, "high");
    }

    #[test]
    fn test_capacity_two_three_normals_evicts_oldest() {
        let queue = PriorityQueue::new(2);
        assert_accepted(queue.push(Item::new("oldest", Priority::Normal)));
        assert_accepted(queue.push(Item::new("middle", Priority::Normal)));
        match queue.push(Item::new("newest", Priority::Normal)) {
            PushOutcome::AcceptedEvicting(victim) => assert_eq!(victim.label, "oldest"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().label, "middle");
        assert_eq!(queue.pop().unwrap().label, "newest");
    }

    #[test]
    fn test_push_front_preserves_position() {
        let queue = PriorityQueue::new(10);
        assert_accepted(queue.push(Item::new("first", Priority::Normal)));
        assert_accepted(queue.push(Item::new("second", Priority::Normal)));

        let popped = queue.pop().unwrap();
        assert_eq!(popped.label, "first");
        queue.push_front(popped);
        assert_eq!(queue.pop().unwrap().label, "first");
        assert_eq!(queue.pop().unwrap().label, "second");
    }

    #[test]
    fn test_clear_and_len() {
        let queue = PriorityQueue::new(10);
        assert!(queue.is_empty());
        assert_accepted(queue.push(Item::new("a", Priority::Low)));
        assert_accepted(queue.push(Item::new("b", Priority::Critical)));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_messages_use_header_priority() {
        let queue = PriorityQueue::new(10);
        assert_accepted(queue.push(Message::request("a", "b", "slow")));
        assert_accepted(queue.push(
            Message::request("a", "b", "fast").with_priority(Priority::Critical),
        ));
        assert_eq!(queue.pop().unwrap().body.action, "fast");
        assert_eq!(queue.pop().unwrap().body.action, "slow");
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_empty_on_idle_queue() {
        let queue: PriorityQueue<Item> = PriorityQueue::new(10);
        let popped = queue.pop_timeout(Duration::from_millis(20)).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_pop_timeout_sees_concurrent_push() {
        let queue = std::sync::Arc::new(PriorityQueue::new(10));
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(Item::new("late", Priority::Normal));
        });
        let popped = queue.pop_timeout(Duration::from_secs(1)).await;
        assert_eq!(popped.unwrap().label, "late");
        handle.await.unwrap();
    }
}
