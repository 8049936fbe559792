//! A self-reposting task: an operation that runs on a dedicated
//! `Dispatcher` and, unless stopped, immediately reposts itself after each
//! run. Grounded on `concurrency.h`'s `active_object<T>` template; the
//! watchdog is built on top of this (`uvc-streamer.h`'s `watchdog`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::dispatcher::{CancellableTimer, Dispatcher};

type Operation = Arc<dyn Fn(&CancellableTimer) + Send + Sync>;

/// Runs `operation` repeatedly on a private single-slot dispatcher, each
/// iteration re-posting itself until `stop()` is called.
pub struct ActiveObject {
    dispatcher: Arc<Dispatcher>,
    stopped: Arc<AtomicBool>,
    op: Operation,
}

impl ActiveObject {
    pub fn new<F>(operation: F) -> Self
    where
        F: Fn(&CancellableTimer) + Send + Sync + 'static,
    {
        ActiveObject {
            dispatcher: Arc::new(Dispatcher::new(1)),
            stopped: Arc::new(AtomicBool::new(true)),
            op: Arc::new(operation),
        }
    }

    pub fn start(&self) {
        if !self.stopped.swap(false, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.start();
        Self::post_run(self.stopped.clone(), self.dispatcher.clone(), self.op.clone());
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.dispatcher.stop(true);
    }

    pub fn running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    fn post_run(stopped: Arc<AtomicBool>, dispatcher: Arc<Dispatcher>, op: Operation) {
        let dispatcher2 = dispatcher.clone();
        dispatcher.invoke(
            move |timer: &CancellableTimer| {
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                op(timer);
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                Self::post_run(stopped.clone(), dispatcher2.clone(), op.clone());
            },
            false,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_repeatedly_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let obj = ActiveObject::new(move |timer: &CancellableTimer| {
            c.fetch_add(1, Ordering::SeqCst);
            timer.try_sleep(5);
        });
        assert!(!obj.running());
        obj.start();
        assert!(obj.running());
        std::thread::sleep(Duration::from_millis(60));
        obj.stop();
        assert!(!obj.running());
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn start_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let obj = ActiveObject::new(move |_timer: &CancellableTimer| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        obj.start();
        obj.start();
        obj.stop();
    }
}
