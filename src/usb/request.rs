//! Asynchronous transfer requests and their completion callbacks.
//! Grounded on `backend/transfer_queue.rs`'s in-flight-transfer bookkeeping
//! and the original driver's `usb-request.h` (`usb_request_callback`,
//! cancellation on drop).

use std::sync::{Arc, Mutex};

use super::UsbStatus;

/// A single outstanding bulk transfer: the buffer it reads into (or wrote
/// from) and the status it completed with. Produced by a backend, consumed
/// by the UVC payload parser or the DFU download loop.
#[derive(Debug)]
pub struct UsbRequest {
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
    pub status: UsbStatus,
}

impl UsbRequest {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }
}

type Completion = Box<dyn FnMut(UsbRequest) + Send>;

/// Holds a completion closure that a backend invokes when a submitted
/// transfer finishes. Cleared under a mutex so `cancel()` and a racing
/// completion can never both run the closure.
///
/// The original's destructor also cancels outstanding callbacks; we do the
/// same via `Drop`, so a `UvcStreamer` dropped without an explicit `stop()`
/// can't have a completion land on a buffer that's gone.
pub struct UsbRequestCallback {
    inner: Arc<Mutex<Option<Completion>>>,
}

impl UsbRequestCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(UsbRequest) + Send + 'static,
    {
        UsbRequestCallback {
            inner: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Invoke the closure with `request`, unless it has been cancelled.
    pub fn complete(&self, request: UsbRequest) {
        if let Some(f) = self.inner.lock().unwrap().as_mut() {
            f(request);
        }
    }

    /// Clear the closure. Any completion racing this call either runs
    /// before or not at all; it never partially observes a cleared slot.
    pub fn cancel(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().is_none()
    }
}

impl Clone for UsbRequestCallback {
    fn clone(&self) -> Self {
        UsbRequestCallback { inner: self.inner.clone() }
    }
}

impl Drop for UsbRequestCallback {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Tracks a request submitted to a backend so it can be looked up again
/// when the completion arrives out of order.
pub struct RequestHolder {
    pub id: u64,
    pub callback: UsbRequestCallback,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_suppresses_later_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cb = UsbRequestCallback::new(move |_req| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cb.cancel();
        cb.complete(UsbRequest {
            endpoint: 0x81,
            buffer: vec![0; 4],
            actual_length: 4,
            status: UsbStatus::Success,
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_cancels_outstanding_clone() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cb = UsbRequestCallback::new(move |_req| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let clone = cb.clone();
        drop(cb);
        assert!(clone.is_cancelled());
        clone.complete(UsbRequest {
            endpoint: 0x81,
            buffer: vec![0; 4],
            actual_length: 4,
            status: UsbStatus::Success,
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
