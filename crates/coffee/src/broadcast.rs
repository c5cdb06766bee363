//! Live broadcaster: fan-out of applied records to any number of observers.
//!
//! Each observer owns a bounded queue. Publishing pushes into every queue
//! without waiting; a full queue drops its oldest item and the observer is
//! told how many it lost ([Delivery::Dropped]) before the items that remain.
//! Nothing is replayed: an observer that reconnects re-reads the mirror.

use crate::entry::MirrorRecord;
use crate::live::LiveMessage;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;

/// Default per-observer queue length.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 64;

/// Unique observer identifier.
pub type ObserverId = u64;

/// An applied record as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastEvent {
    /// Per-broadcaster counter starting at 1; a jump means the observer missed events.
    pub broadcast_sequence: u64,
    pub record: MirrorRecord,
}

/// What an observer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(BroadcastEvent),
    /// This many older items were discarded because the observer fell behind.
    Dropped(u64),
    /// Out-of-band status (reorg, indexer halt).
    Notice(LiveMessage),
}

#[derive(Debug, Default)]
struct QueueState {
    buf: VecDeque<Delivery>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    // A panic while holding the lock cannot leave the queue half-updated.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, delivery: Delivery) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if state.buf.len() >= self.capacity {
                state.buf.pop_front();
                state.dropped += 1;
            }
            state.buf.push_back(delivery);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Delivery> {
        let mut state = self.lock();
        if state.dropped > 0 {
            return Some(Delivery::Dropped(std::mem::take(&mut state.dropped)));
        }
        state.buf.pop_front()
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[derive(Debug)]
struct Inner {
    observers: DashMap<ObserverId, Arc<Queue>>,
    next_observer: AtomicU64,
    next_sequence: AtomicU64,
    capacity: usize,
}

/// Fan-out hub. Cheap to clone; all clones share observers and counters.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// `capacity` bounds every observer's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                observers: DashMap::new(),
                next_observer: AtomicU64::new(1),
                next_sequence: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    /// Fan a newly applied record out to every observer. Never blocks on observers.
    pub fn publish(&self, record: MirrorRecord) -> BroadcastEvent {
        let event = BroadcastEvent {
            broadcast_sequence: self.inner.next_sequence.fetch_add(1, Ordering::Relaxed),
            record,
        };
        self.fan_out(Delivery::Event(event.clone()));
        tracing::debug!(
            broadcast_sequence = event.broadcast_sequence,
            seq = event.record.sequence(),
            observers = self.inner.observers.len(),
            "published"
        );
        event
    }

    /// Fan an out-of-band notice out to every observer.
    pub fn notify(&self, message: LiveMessage) {
        self.fan_out(Delivery::Notice(message));
    }

    fn fan_out(&self, delivery: Delivery) {
        for entry in self.inner.observers.iter() {
            entry.value().push(delivery.clone());
        }
    }

    pub fn register(&self) -> Observer {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(Queue::new(self.inner.capacity));
        self.inner.observers.insert(id, Arc::clone(&queue));
        tracing::info!(
            observer = id,
            total = self.inner.observers.len(),
            "observer registered"
        );
        Observer {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove an observer; its queue is closed and discarded.
    pub fn unregister(&self, id: ObserverId) {
        if let Some((_, queue)) = self.inner.observers.remove(&id) {
            queue.close();
            tracing::info!(
                observer = id,
                remaining = self.inner.observers.len(),
                "observer unregistered"
            );
        }
    }

    /// Close every observer (shutdown). Items already queued may still be read.
    pub fn close_all(&self) {
        let ids: Vec<ObserverId> = self.inner.observers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, queue)) = self.inner.observers.remove(&id) {
                queue.close();
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_CAPACITY)
    }
}

/// Receiving end for one observer. Dropping it unregisters.
#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    queue: Arc<Queue>,
    hub: Weak<Inner>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next delivery; `None` once the observer is closed and drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.queue.pop() {
                return Some(delivery);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next delivery if one is buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.queue.pop()
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.observers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LedgerEntry, SourcePosition};
    use std::time::{Duration, Instant};

    fn record(sequence: u64) -> MirrorRecord {
        MirrorRecord::new(
            LedgerEntry {
                sequence,
                author: "alice".into(),
                message: "nice work".into(),
                amount: 1000,
                timestamp: 1_700_000_000,
                sender: [1; 20],
            },
            SourcePosition::new(sequence, 0, [0; 32]),
        )
    }

    fn seq_of(d: Option<Delivery>) -> u64 {
        match d {
            Some(Delivery::Event(e)) => e.record.sequence(),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn every_observer_sees_every_event_in_order() {
        let hub = Broadcaster::new(8);
        let mut a = hub.register();
        let mut b = hub.register();
        for seq in 1..=3 {
            hub.publish(record(seq));
        }
        for obs in [&mut a, &mut b] {
            assert_eq!(seq_of(obs.recv().await), 1);
            assert_eq!(seq_of(obs.recv().await), 2);
            assert_eq!(seq_of(obs.recv().await), 3);
        }
    }

    #[test]
    fn broadcast_sequence_is_monotonic() {
        let hub = Broadcaster::new(8);
        assert_eq!(hub.publish(record(1)).broadcast_sequence, 1);
        assert_eq!(hub.publish(record(2)).broadcast_sequence, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_reports_count() {
        let hub = Broadcaster::new(2);
        let mut slow = hub.register();
        for seq in 1..=5 {
            hub.publish(record(seq));
        }
        assert_eq!(slow.recv().await, Some(Delivery::Dropped(3)));
        assert_eq!(seq_of(slow.recv().await), 4);
        assert_eq!(seq_of(slow.recv().await), 5);
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_observer_does_not_hold_back_others() {
        let hub = Broadcaster::new(4);
        let _stalled = hub.register();
        let mut fast = hub.register();
        let started = Instant::now();
        for seq in 1..=10_000 {
            hub.publish(record(seq));
            assert_eq!(seq_of(fast.try_recv()), seq);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let hub = Broadcaster::new(4);
        let mut obs = hub.register();
        let publisher = hub.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(record(7));
        });
        assert_eq!(seq_of(obs.recv().await), 7);
        task.await.unwrap();
    }

    #[test]
    fn recv_is_pending_until_something_arrives() {
        let hub = Broadcaster::new(4);
        let mut obs = hub.register();
        let mut recv = tokio_test::task::spawn(obs.recv());
        tokio_test::assert_pending!(recv.poll());
        hub.publish(record(1));
        assert!(recv.is_woken());
        assert_eq!(seq_of(tokio_test::assert_ready!(recv.poll())), 1);
    }

    #[test]
    fn close_wakes_a_parked_observer() {
        let hub = Broadcaster::new(4);
        let mut obs = hub.register();
        let mut recv = tokio_test::task::spawn(obs.recv());
        tokio_test::assert_pending!(recv.poll());
        hub.close_all();
        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), None);
    }

    #[tokio::test]
    async fn unregister_and_drop_remove_observers() {
        let hub = Broadcaster::new(4);
        let mut a = hub.register();
        let b = hub.register();
        assert_eq!(hub.observer_count(), 2);
        hub.unregister(a.id());
        assert_eq!(a.recv().await, None);
        drop(b);
        assert_eq!(hub.observer_count(), 0);
        hub.publish(record(1));
    }

    #[tokio::test]
    async fn close_all_drains_then_ends() {
        let hub = Broadcaster::new(4);
        let mut obs = hub.register();
        hub.notify(LiveMessage::info("indexer stopping"));
        hub.close_all();
        assert!(matches!(obs.recv().await, Some(Delivery::Notice(_))));
        assert_eq!(obs.recv().await, None);
        assert_eq!(hub.observer_count(), 0);
    }
}
