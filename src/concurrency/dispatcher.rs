//! A worker thread fed by a bounded queue of boxed continuations, plus a
//! cancellable sleep primitive the continuations can use to behave
//! cooperatively. Grounded on `concurrency.h`'s `dispatcher` from the
//! original driver, translated into the teacher's own
//! `spawn(move || block_on(...))` worker-thread idiom
//! (`src/backend/mod.rs::run_capture`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::queue::BoundedQueue;

type Continuation = Box<dyn FnOnce(&CancellableTimer) + Send>;

struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Passed to every dispatched continuation so it can sleep in a way that
/// wakes immediately if the dispatcher is stopped.
#[derive(Clone)]
pub struct CancellableTimer {
    flag: Arc<StopFlag>,
}

impl CancellableTimer {
    /// Waits up to `ms` milliseconds. Returns `true` if the full duration
    /// elapsed, `false` if woken early by `stop()`.
    pub fn try_sleep(&self, ms: u64) -> bool {
        let guard = self.flag.stopped.lock().unwrap();
        let (_guard, result) = self
            .cv_wait(guard, Duration::from_millis(ms))
            .unwrap();
        result
    }

    fn cv_wait<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, bool>,
        timeout: Duration,
    ) -> std::sync::LockResult<(std::sync::MutexGuard<'a, bool>, bool)> {
        let (guard, timeout_result) = self
            .flag
            .cv
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap();
        // timed_out() is true iff the predicate was still false when time
        // ran out, i.e. we were *not* cancelled.
        Ok((guard, timeout_result.timed_out()))
    }
}

/// Bounded queue of continuations plus a worker thread that runs them.
pub struct Dispatcher {
    queue: Arc<BoundedQueue<Continuation>>,
    flag: Arc<StopFlag>,
    worker: Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let alive = Arc::new(AtomicBool::new(true));

        let worker = {
            let queue = queue.clone();
            let flag = flag.clone();
            let alive = alive.clone();
            std::thread::spawn(move || {
                while alive.load(Ordering::Acquire) {
                    if let Some(item) = queue.dequeue(Duration::from_millis(500)) {
                        let timer = CancellableTimer { flag: flag.clone() };
                        // A continuation that panics must not take the worker
                        // thread down with it (every backend built on this
                        // Dispatcher would silently stop).
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            item(&timer);
                        }));
                    }
                }
            })
        };

        Dispatcher {
            queue,
            flag,
            worker: Mutex::new(Some(worker)),
            alive,
        }
    }

    /// Post a continuation. Swallows the post entirely once stopped.
    pub fn invoke<F>(&self, item: F, blocking: bool)
    where
        F: FnOnce(&CancellableTimer) + Send + 'static,
    {
        if *self.flag.stopped.lock().unwrap() {
            return;
        }
        let boxed: Continuation = Box::new(item);
        if blocking {
            self.queue.blocking_enqueue(boxed);
        } else {
            self.queue.enqueue(boxed);
        }
    }

    pub fn start(&self) {
        *self.flag.stopped.lock().unwrap() = false;
        self.queue.start();
    }

    /// Stop accepting work, wake any sleeping continuation, and wait for
    /// the in-flight one (if any) to finish.
    pub fn stop(&self, clear: bool) {
        {
            let mut stopped = self.flag.stopped.lock().unwrap();
            *stopped = true;
            self.flag.cv.notify_all();
        }
        self.flush(clear, Duration::from_secs(10));
    }

    /// Post a sentinel and wait (bounded) for it to run. The public
    /// liveness probe: if this returns `true`, the worker thread drained
    /// everything queued before the sentinel.
    pub fn flush(&self, clear: bool, timeout: Duration) -> bool {
        if clear {
            self.queue.flush();
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let done2 = done.clone();
        self.queue.enqueue(Box::new(move |_timer: &CancellableTimer| {
            let (lock, cv) = &*done2;
            *lock.lock().unwrap() = true;
            cv.notify_one();
        }));

        let (lock, cv) = &*done;
        let guard = lock.lock().unwrap();
        let (_guard, result) = cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap();
        !result.timed_out()
    }

    pub fn empty(&self) -> bool {
        self.queue.size() == 0
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop(true);
        self.alive.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn invoke_runs_on_worker_thread() {
        let d = Dispatcher::new(4);
        d.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        d.invoke(move |_t| { c.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(d.flush(false, Duration::from_secs(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_cancels_sleeping_timer() {
        let d = Arc::new(Dispatcher::new(4));
        d.start();
        let woke_early = Arc::new(AtomicBool::new(false));
        let woke_early2 = woke_early.clone();
        d.invoke(move |timer| {
            if !timer.try_sleep(5_000) {
                woke_early2.store(true, Ordering::SeqCst);
            }
        }, false);
        std::thread::sleep(Duration::from_millis(50));
        d.stop(true);
        assert!(woke_early.load(Ordering::SeqCst));
    }
}
