//! Bounded per-OU record rings.
//!
//! One producer (the engine, on the event-dispatch thread), one consumer
//! (the router). A full ring drops the newest record and counts it; the
//! producer never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Result of a consumer pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult {
    Record(Vec<u8>),
    TimedOut,
    Closed,
}

struct RingInner {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

pub struct RecordRing {
    inner: Mutex<RingInner>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl RecordRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish one record. Returns false (and counts a drop) when the ring
    /// is full or closed.
    pub fn push(&self, record: Vec<u8>) -> bool {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.closed || inner.queue.len() >= self.capacity {
            drop(inner);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.queue.push_back(record);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Consumer-side pop with a read deadline so shutdown can be observed.
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(record) = inner.queue.pop_front() {
                return PopResult::Record(record);
            }
            if inner.closed {
                return PopResult::Closed;
            }
            let (guard, wait) = self
                .available
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
            if wait.timed_out() {
                return match inner.queue.pop_front() {
                    Some(record) => PopResult::Record(record),
                    None if inner.closed => PopResult::Closed,
                    None => PopResult::TimedOut,
                };
            }
        }
    }

    /// Close the ring. Queued records remain poppable; new pushes drop.
    pub fn close(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let ring = RecordRing::new(4);
        assert!(ring.push(vec![1]));
        assert!(ring.push(vec![2]));
        assert_eq!(
            ring.pop_timeout(Duration::from_millis(10)),
            PopResult::Record(vec![1])
        );
        assert_eq!(
            ring.pop_timeout(Duration::from_millis(10)),
            PopResult::Record(vec![2])
        );
        assert_eq!(
            ring.pop_timeout(Duration::from_millis(1)),
            PopResult::TimedOut
        );
    }

    #[test]
    fn full_ring_drops_newest_and_counts() {
        let ring = RecordRing::new(2);
        assert!(ring.push(vec![1]));
        assert!(ring.push(vec![2]));
        assert!(!ring.push(vec![3]));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let ring = RecordRing::new(2);
        ring.push(vec![9]);
        ring.close();
        assert!(!ring.push(vec![10]));
        assert_eq!(
            ring.pop_timeout(Duration::from_millis(10)),
            PopResult::Record(vec![9])
        );
        assert_eq!(ring.pop_timeout(Duration::from_millis(10)), PopResult::Closed);
    }

    #[test]
    fn consumer_wakes_on_cross_thread_push() {
        use std::sync::Arc;
        let ring = Arc::new(RecordRing::new(4));
        let producer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(vec![7]);
        });
        assert_eq!(
            ring.pop_timeout(Duration::from_secs(5)),
            PopResult::Record(vec![7])
        );
        handle.join().unwrap();
    }
}
