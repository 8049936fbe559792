//! Stall-recovery watchdog: if nobody calls `kick()` during a full
//! timeout period, run a recovery operation once. Grounded on
//! `uvc-streamer.h`'s `watchdog` class: an `active_object` that sleeps for
//! the timeout, and only fires if its `_kicked` flag is still clear when
//! it wakes, clearing the flag either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::active_object::ActiveObject;
use super::dispatcher::CancellableTimer;

struct Shared {
    kicked: Mutex<bool>,
    timeout_ms: AtomicU64,
}

/// Watches for inactivity and fires `on_stall` once per un-kicked timeout
/// period.
pub struct Watchdog {
    active: ActiveObject,
    shared: Arc<Shared>,
}

impl Watchdog {
    pub fn new<F>(timeout_ms: u64, on_stall: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            kicked: Mutex::new(false),
            timeout_ms: AtomicU64::new(timeout_ms),
        });
        let shared_for_op = shared.clone();

        let active = ActiveObject::new(move |timer: &CancellableTimer| {
            let timeout = shared_for_op.timeout_ms.load(Ordering::Acquire);
            if timer.try_sleep(timeout) {
                let mut kicked = shared_for_op.kicked.lock().unwrap();
                if !*kicked {
                    drop(kicked);
                    on_stall();
                    kicked = shared_for_op.kicked.lock().unwrap();
                }
                *kicked = false;
            }
        });

        Watchdog { active, shared }
    }

    pub fn kick(&self) {
        *self.shared.kicked.lock().unwrap() = true;
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn start(&self) {
        self.active.start();
    }

    pub fn stop(&self) {
        self.active.stop();
    }

    pub fn running(&self) -> bool {
        self.active.running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fires_after_timeout_without_kick() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let wd = Watchdog::new(30, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        wd.start();
        std::thread::sleep(Duration::from_millis(150));
        wd.stop();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn kick_suppresses_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let wd = Watchdog::new(40, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        wd.start();
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(20));
            wd.kick();
        }
        wd.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_then_stop_toggles_running() {
        let wd = Watchdog::new(1000, || {});
        assert!(!wd.running());
        wd.start();
        assert!(wd.running());
        wd.stop();
        assert!(!wd.running());
    }
}
