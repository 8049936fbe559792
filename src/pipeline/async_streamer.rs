//! Async delivery mode: frames go straight to whichever per-stream
//! callback is registered, with no aggregation or buffering. Grounded on
//! `async_streamer.cpp`'s `get_callback` — exact `(stream, index)` match,
//! falling back to `(stream, -1)`, then `(Any, -1)`, then silently
//! dropped.

use std::sync::Arc;

use anyhow::Result;

use crate::frame::{FrameObject, StreamProfile};
use crate::usb::device::UsbMessenger;
use crate::uvc::StreamCtrl;

use super::{Config, FrameCallback, FrameProfile, Streamer, StreamSelector};

/// A pipeline that delivers every frame to its resolved callback as soon
/// as it arrives, with no cross-stream synchronization.
pub struct AsyncStreamer {
    inner: Arc<Streamer>,
}

impl AsyncStreamer {
    pub fn new() -> Self {
        AsyncStreamer { inner: Arc::new(Streamer::new()) }
    }

    pub fn set_callback(&self, selector: StreamSelector, callback: FrameCallback) {
        self.inner.set_callback(selector, callback);
    }

    pub fn start(
        &self,
        config: Config,
        open_stream: impl FnMut(StreamSelector, Option<&StreamProfile>) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)>,
    ) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.start(config, open_stream, move |frame_profile: FrameProfile, fo: FrameObject| {
            route(&inner, frame_profile, fo);
        })
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn get_active_profile(&self) -> Result<super::ActiveProfile> {
        self.inner.get_active_profile()
    }
}

impl Default for AsyncStreamer {
    fn default() -> Self {
        AsyncStreamer::new()
    }
}

fn route(streamer: &Streamer, frame_profile: FrameProfile, fo: FrameObject) {
    if let Some(callback) = streamer.resolve_callback(frame_profile.selector) {
        callback(frame_profile, fo);
    }
    // No callback resolved for this stream: the frame is dropped, same as
    // the commented-out `throw` in the original's `get_callback` lambda.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StreamKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn resolves_exact_then_wildcard_then_any() {
        let streamer = Streamer::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h1 = hits.clone();
        streamer.set_callback(
            StreamSelector::new(StreamKind::Depth, 0),
            Arc::new(move |_p, _f| h1.lock().unwrap().push("exact")),
        );
        let h2 = hits.clone();
        streamer.set_callback(
            StreamSelector::wildcard_for(StreamKind::Color),
            Arc::new(move |_p, _f| h2.lock().unwrap().push("kind-wildcard")),
        );
        let h3 = hits.clone();
        streamer.set_callback(StreamSelector::ANY, Arc::new(move |_p, _f| h3.lock().unwrap().push("any")));

        assert!(streamer.resolve_callback(StreamSelector::new(StreamKind::Depth, 0)).is_some());
        assert!(streamer.resolve_callback(StreamSelector::new(StreamKind::Color, 1)).is_some());
        assert!(streamer.resolve_callback(StreamSelector::new(StreamKind::Infrared, 0)).is_some());
    }

    #[test]
    fn no_match_drops_frame() {
        let streamer = Streamer::new();
        assert!(streamer.resolve_callback(StreamSelector::new(StreamKind::Depth, 0)).is_none());
    }

    #[test]
    fn route_invokes_resolved_callback_once() {
        let streamer = Streamer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        streamer.set_callback(StreamSelector::ANY, Arc::new(move |_p, _f| { c.fetch_add(1, Ordering::SeqCst); }));

        let profile = crate::frame::StreamProfile { width: 1, height: 1, fps: 1, format: 0 };
        let archive = crate::frame::FrameArchive::new(4);
        let frame = archive.allocate().unwrap();
        let fo = frame.into_frame_object(0, 4);
        route(&streamer, FrameProfile { selector: StreamSelector::new(StreamKind::Depth, 0), profile }, fo);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
