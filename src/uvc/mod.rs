//! UVC streaming engine: keeps `request_count` bulk-in transfers
//! perpetually in flight, reassembles payloads into frames, and publishes
//! them to a user callback from a dedicated thread. Grounded on
//! `uvc-streamer.h`/`uvc-streamer.cpp`: the watchdog resets the read
//! endpoint on stall, the publish thread dequeues with a 50ms timeout, and
//! `stop()` drains the frame archive before releasing the endpoint.

pub mod parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::future::block_on;

use crate::concurrency::{ActiveObject, BoundedQueue, Watchdog};
use crate::frame::{FrameArchive, FrameObject, StreamProfile};
use crate::usb::device::UsbMessenger;
use crate::usb::request::{UsbRequest, UsbRequestCallback};
use crate::usb::UsbStatus;

const UVC_PAYLOAD_MAX_HEADER_LENGTH: usize = 256;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(50);
const WATCHDOG_RESET_TIMEOUT_MS: u64 = 1000;
const RESET_ENDPOINT_TIMEOUT_MS: u32 = 1000;

/// The subset of the UVC Video Probe/Commit control fields this engine
/// needs once streaming parameters are negotiated.
#[derive(Clone, Copy, Debug)]
pub struct StreamCtrl {
    pub b_interface_number: u8,
    pub dw_max_video_frame_size: u32,
}

/// Everything a `UvcStreamer` needs to run: which profile it's delivering,
/// where to deliver it, and the open device/endpoint to read from.
pub struct UvcStreamerContext {
    pub profile: StreamProfile,
    pub user_cb: Arc<dyn Fn(StreamProfile, FrameObject) + Send + Sync>,
    pub control: StreamCtrl,
    pub messenger: Arc<dyn UsbMessenger>,
    pub endpoint: u8,
    pub request_count: u8,
}

struct Shared {
    running: AtomicBool,
    context: UvcStreamerContext,
    read_buf_len: usize,
    queue: BoundedQueue<FrameObject>,
    frames_archive: Arc<FrameArchive>,
    watchdog_timeout_ms: u64,
}

pub struct UvcStreamer {
    shared: Arc<Shared>,
    watchdog: Arc<Watchdog>,
    publish_thread: ActiveObject,
    request_callbacks: Mutex<Vec<UsbRequestCallback>>,
}

impl UvcStreamer {
    pub fn new(context: UvcStreamerContext) -> Self {
        let read_buf_len = UVC_PAYLOAD_MAX_HEADER_LENGTH + context.control.dw_max_video_frame_size as usize;
        // Same heuristic as the original: ten dequeue intervals per frame
        // period before declaring a stall.
        let watchdog_timeout_ms = ((1000.0 / context.profile.fps.max(1) as f64) * 10.0) as u64;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            context,
            read_buf_len,
            // Frame delivery always favors the freshest frame over
            // buffering a backlog; capacity 1 means a slow publish thread
            // drops stale frames instead of lagging behind real time.
            queue: BoundedQueue::new(1),
            frames_archive: FrameArchive::new(read_buf_len),
            watchdog_timeout_ms,
        });

        let watchdog_shared = shared.clone();
        let watchdog = Arc::new_cyclic(|weak: &std::sync::Weak<Watchdog>| {
            let weak = weak.clone();
            Watchdog::new(watchdog_timeout_ms, move || {
                let _ = watchdog_shared
                    .context
                    .messenger
                    .reset_endpoint(watchdog_shared.context.endpoint, RESET_ENDPOINT_TIMEOUT_MS);
                eprintln!(
                    "uvc streamer watchdog triggered on endpoint {:#x}",
                    watchdog_shared.context.endpoint
                );
                // Back off to a fixed ceiling after firing, so a device
                // that's slow to recover isn't re-triggered immediately.
                if let Some(wd) = weak.upgrade() {
                    wd.set_timeout(WATCHDOG_RESET_TIMEOUT_MS);
                }
            })
        });

        let publish_shared = shared.clone();
        let publish_thread = ActiveObject::new(move |_timer| {
            if let Some(fo) = publish_shared.queue.dequeue(DEQUEUE_TIMEOUT) {
                if publish_shared.running.load(Ordering::Acquire) {
                    (publish_shared.context.user_cb)(publish_shared.context.profile.clone(), fo);
                }
            }
        });

        UvcStreamer {
            shared,
            watchdog,
            publish_thread,
            request_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        if self.running() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);

        // Clear any halt left over from a previous stream before the first
        // request goes out.
        let _ = self
            .shared
            .context
            .messenger
            .reset_endpoint(self.shared.context.endpoint, RESET_ENDPOINT_TIMEOUT_MS);

        let mut callbacks = self.request_callbacks.lock().unwrap();
        callbacks.clear();
        for _ in 0..self.shared.context.request_count {
            let callback = make_request_callback(self.shared.clone(), self.watchdog.clone());
            submit(&self.shared, callback.clone());
            callbacks.push(callback);
        }
        drop(callbacks);

        self.publish_thread.start();
    }

    pub fn stop(&self) {
        if !self.running() {
            return;
        }
        self.shared.running.store(false, Ordering::Release);

        for callback in self.request_callbacks.lock().unwrap().drain(..) {
            callback.cancel();
        }

        self.shared.queue.clear();
        self.shared.frames_archive.stop_allocation();
        self.shared.frames_archive.wait_until_empty();

        let _ = self
            .shared
            .context
            .messenger
            .reset_endpoint(self.shared.context.endpoint, RESET_ENDPOINT_TIMEOUT_MS);

        self.watchdog.stop();
        self.publish_thread.stop();
    }
}

impl Drop for UvcStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn submit(shared: &Arc<Shared>, callback: UsbRequestCallback) {
    let messenger = shared.context.messenger.clone();
    let endpoint = shared.context.endpoint;
    let length = shared.read_buf_len;
    block_on(messenger.submit_bulk_in(endpoint, length, callback)).ok();
}

fn make_request_callback(shared: Arc<Shared>, watchdog: Arc<Watchdog>) -> UsbRequestCallback {
    UsbRequestCallback::new(move |request: UsbRequest| {
        if !watchdog.running() {
            watchdog.start();
        }
        watchdog.set_timeout(shared.watchdog_timeout_ms);

        if request.status == UsbStatus::Success
            && request.actual_length >= shared.context.control.dw_max_video_frame_size as usize
        {
            if let Some(mut frame) = shared.frames_archive.allocate() {
                watchdog.kick();
                frame.buffer[..request.actual_length].copy_from_slice(request.data());
                if let parser::PayloadOutcome::Ok { header_len, .. } =
                    parser::inspect_payload(&frame.buffer, request.actual_length)
                {
                    let fo = frame.into_frame_object(header_len, request.actual_length);
                    shared.queue.enqueue(fo);
                }
                // Malformed packets are silently dropped; `frame` returns
                // to the pool when it goes out of scope either way.
            }
        }

        if shared.running.load(Ordering::Acquire) {
            let callback = make_request_callback(shared.clone(), watchdog.clone());
            submit(&shared, callback);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_timeout_derives_from_fps() {
        let timeout = ((1000.0 / 30.0) * 10.0) as u64;
        assert_eq!(timeout, 333);
    }

    #[test]
    fn watchdog_reset_ceiling_constant_matches_original() {
        assert_eq!(WATCHDOG_RESET_TIMEOUT_MS, 1000);
    }
}
