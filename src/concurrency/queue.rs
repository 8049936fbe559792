//! Bounded single-consumer queue, as used to pass frames and device
//! completions between worker threads without an async runtime.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    accepting: bool,
    need_to_flush: bool,
}

/// A FIFO queue with a fixed capacity and a single consumer.
///
/// Mirrors the original driver's `single_consumer_queue`: non-blocking
/// `enqueue` drops the oldest item once `size > cap`, `blocking_enqueue`
/// suspends the producer instead, and `dequeue` wakes on either a new item
/// or a flush request.
pub struct BoundedQueue<T> {
    cap: usize,
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
    has_room: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        BoundedQueue {
            cap,
            state: Mutex::new(Inner {
                items: VecDeque::new(),
                accepting: true,
                need_to_flush: false,
            }),
            not_empty: Condvar::new(),
            has_room: Condvar::new(),
        }
    }

    /// Non-blocking enqueue. Drops the oldest item if this push would leave
    /// the queue over capacity. No-op while not accepting (i.e. cleared).
    pub fn enqueue(&self, item: T) {
        let mut inner = self.state.lock().unwrap();
        if !inner.accepting {
            return;
        }
        inner.items.push_back(item);
        if inner.items.len() > self.cap {
            inner.items.pop_front();
        }
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Suspend the caller until there is room, then enqueue.
    pub fn blocking_enqueue(&self, item: T) {
        let mut inner = self.state.lock().unwrap();
        if !inner.accepting {
            return;
        }
        let cap = self.cap;
        inner = self
            .has_room
            .wait_while(inner, |inner| inner.items.len() > cap)
            .unwrap();
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Wait up to `timeout` for an item, or until flushed. Returns `None`
    /// on timeout or if woken by a flush with nothing to deliver.
    pub fn dequeue(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.state.lock().unwrap();
        inner.accepting = true;
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        loop {
            if !inner.items.is_empty() || inner.need_to_flush {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if result.timed_out() {
                timed_out = true;
                break;
            }
        }

        let item = inner.items.pop_front();
        if item.is_none() {
            // Only a genuine timeout resets the flush flag; waking up on a
            // flush signal with nothing left to deliver leaves it set so
            // the next waiter also observes it, until `start()` clears it.
            if timed_out && inner.need_to_flush && inner.items.is_empty() {
                inner.need_to_flush = false;
            }
            return None;
        }
        drop(inner);
        self.has_room.notify_one();
        item
    }

    /// Non-blocking variant of `dequeue`.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.state.lock().unwrap();
        inner.accepting = true;
        let item = inner.items.pop_front();
        if item.is_some() {
            drop(inner);
            self.has_room.notify_one();
        }
        item
    }

    /// Stop accepting new items, drain, and wake every waiter.
    pub fn clear(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.accepting = false;
        inner.need_to_flush = true;
        inner.items.clear();
        drop(inner);
        self.not_empty.notify_all();
        self.has_room.notify_all();
    }

    /// Drain and wake every waiter, without refusing future enqueues.
    pub fn flush(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.need_to_flush = true;
        inner.items.clear();
        drop(inner);
        self.not_empty.notify_all();
        self.has_room.notify_all();
    }

    /// Re-enable accepting and clear the flush flag.
    pub fn start(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.need_to_flush = false;
        inner.accepting = true;
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_on_overflow() {
        let q = BoundedQueue::new(3);
        for i in 1..=5 {
            q.enqueue(i);
        }
        assert_eq!(q.size(), 3);
        assert_eq!(q.try_dequeue(), Some(3));
        assert_eq!(q.try_dequeue(), Some(4));
        assert_eq!(q.try_dequeue(), Some(5));
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn dequeue_times_out_when_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4);
        let start = Instant::now();
        let result = q.dequeue(Duration::from_millis(20));
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn clear_then_start_reaccepts() {
        let q = BoundedQueue::new(2);
        q.enqueue(1);
        q.clear();
        assert_eq!(q.size(), 0);
        q.enqueue(2);
        // still not accepting until start() is called
        assert_eq!(q.size(), 0);
        q.start();
        q.enqueue(2);
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn flush_woken_empty_pop_keeps_need_to_flush_set() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4);
        q.flush();
        // Woken by the flush signal with nothing queued: must return None
        // without clearing need_to_flush, so a second waiter still sees it.
        let result = q.dequeue(Duration::from_secs(5));
        assert!(result.is_none());
        let result2 = q.dequeue(Duration::from_secs(5));
        assert!(result2.is_none());
        q.start();
        q.enqueue(1);
        assert_eq!(q.try_dequeue(), Some(1));
    }

    #[test]
    fn never_exceeds_capacity_after_each_call() {
        let q = BoundedQueue::new(3);
        for i in 0..100 {
            q.enqueue(i);
            assert!(q.size() <= 3);
        }
    }
}
