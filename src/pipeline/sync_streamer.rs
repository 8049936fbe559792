//! Sync delivery mode: frames from every enabled stream are aggregated
//! into one "frame set" per timestamp and handed back from a blocking
//! `wait_for_frames` call. Grounded on `sync_streamer.cpp`'s
//! `pipeline_processing_block` (last-frame-per-stream map, emit once every
//! required stream id has a frame, single-slot output queue) and
//! `sync_streamer::wait_for_frames`'s one-shot reconnect-and-retry on a
//! timed-out dequeue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::concurrency::BoundedQueue;
use crate::frame::{FrameObject, StreamProfile};
use crate::usb::device::UsbMessenger;
use crate::uvc::StreamCtrl;

use super::{Config, FrameProfile, Streamer, StreamSelector};

/// One frame from each of the configured streams, delivered together.
pub type FrameSet = Vec<(StreamSelector, FrameObject)>;

struct PipelineProcessingBlock {
    required: Vec<StreamSelector>,
    last_set: Mutex<HashMap<StreamSelector, FrameObject>>,
    queue: BoundedQueue<FrameSet>,
}

impl PipelineProcessingBlock {
    fn new(required: Vec<StreamSelector>) -> Self {
        PipelineProcessingBlock {
            required,
            last_set: Mutex::new(HashMap::new()),
            // Single-slot output queue, matching
            // `single_consumer_frame_queue<frame_holder>(1)`.
            queue: BoundedQueue::new(1),
        }
    }

    fn handle_frame(&self, frame_profile: FrameProfile, fo: FrameObject) {
        let mut last_set = self.last_set.lock().unwrap();
        last_set.insert(frame_profile.selector, fo);

        if self.required.iter().any(|s| !last_set.contains_key(s)) {
            return;
        }

        let set: FrameSet = last_set
            .iter()
            .map(|(selector, fo)| (*selector, fo.clone()))
            .collect();
        self.queue.enqueue(set);
    }

    fn dequeue(&self, timeout: Duration) -> Option<FrameSet> {
        self.queue.dequeue(timeout)
    }

    fn try_dequeue(&self) -> Option<FrameSet> {
        self.queue.try_dequeue()
    }
}

type OpenStreamFn<'a> =
    dyn FnMut(StreamSelector, Option<&StreamProfile>) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)> + 'a;

/// A pipeline that aggregates every enabled stream's latest frame and
/// hands them back together from `wait_for_frames`/`poll_for_frames`.
pub struct SyncStreamer {
    inner: Arc<Streamer>,
    block: Mutex<Option<Arc<PipelineProcessingBlock>>>,
}

impl SyncStreamer {
    pub fn new() -> Self {
        SyncStreamer {
            inner: Arc::new(Streamer::new()),
            block: Mutex::new(None),
        }
    }

    pub fn start(&self, config: Config, mut open_stream: Box<OpenStreamFn<'static>>) -> Result<()> {
        let required: Vec<StreamSelector> = config.requested_streams().map(|(selector, _)| selector).collect();
        let block = Arc::new(PipelineProcessingBlock::new(required));
        *self.block.lock().unwrap() = Some(block.clone());

        self.inner.start(
            config,
            move |selector, profile| open_stream(selector, profile),
            move |frame_profile: FrameProfile, fo: FrameObject| {
                block.handle_frame(frame_profile, fo);
            },
        )
    }

    pub fn stop(&self) {
        self.inner.stop();
        *self.block.lock().unwrap() = None;
    }

    pub fn get_active_profile(&self) -> Result<super::ActiveProfile> {
        self.inner.get_active_profile()
    }

    /// Block until a full frame set is available, reconnecting at most
    /// once if the wait times out and the device appears to have dropped
    /// `open_stream`'s availability check.
    pub fn wait_for_frames(
        &self,
        timeout: Duration,
        reopen: impl FnOnce() -> Result<Box<OpenStreamFn<'static>>>,
    ) -> Result<FrameSet> {
        let block = self.current_block()?;
        if let Some(set) = block.dequeue(timeout) {
            return Ok(set);
        }

        // One-shot reconnect: a single failed dequeue may mean the device
        // dropped off the bus, so restart once against the same
        // configuration before giving up, mirroring
        // `sync_streamer::wait_for_frames`'s single `unsafe_stop`+
        // `unsafe_start` retry.
        let reopen_fn = reopen()?;
        self.restart(reopen_fn)?;

        let block = self.current_block()?;
        block.dequeue(timeout).ok_or_else(|| anyhow::anyhow!("frame didn't arrive within {timeout:?}"))
    }

    pub fn poll_for_frames(&self) -> Result<Option<FrameSet>> {
        let block = self.current_block()?;
        Ok(block.try_dequeue())
    }

    fn current_block(&self) -> Result<Arc<PipelineProcessingBlock>> {
        self.block
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wait_for_frames cannot be called before start()"))
    }

    fn restart(&self, open_stream: Box<OpenStreamFn<'static>>) -> Result<()> {
        if self.inner.get_active_profile().is_err() {
            bail!("no active stream configuration to restart");
        }

        let required: Vec<StreamSelector> = self
            .inner
            .get_active_profile()?
            .streams
            .iter()
            .map(|(selector, _)| *selector)
            .collect();
        let block = Arc::new(PipelineProcessingBlock::new(required));
        *self.block.lock().unwrap() = Some(block.clone());

        let mut open_stream = open_stream;
        self.inner.restart_with_previous_config(
            move |selector, profile| open_stream(selector, profile),
            move |frame_profile: FrameProfile, fo: FrameObject| {
                block.handle_frame(frame_profile, fo);
            },
        )
    }
}

impl Default for SyncStreamer {
    fn default() -> Self {
        SyncStreamer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameArchive;
    use crate::pipeline::StreamKind;

    #[test]
    fn emits_only_once_every_required_stream_present() {
        let required = vec![
            StreamSelector::new(StreamKind::Depth, 0),
            StreamSelector::new(StreamKind::Color, 0),
        ];
        let block = PipelineProcessingBlock::new(required);
        let archive = FrameArchive::new(4);
        let profile = StreamProfile { width: 1, height: 1, fps: 1, format: 0 };

        let fo1 = archive.allocate().unwrap().into_frame_object(0, 4);
        block.handle_frame(
            FrameProfile { selector: StreamSelector::new(StreamKind::Depth, 0), profile: profile.clone() },
            fo1,
        );
        assert!(block.try_dequeue().is_none());

        let fo2 = archive.allocate().unwrap().into_frame_object(0, 4);
        block.handle_frame(
            FrameProfile { selector: StreamSelector::new(StreamKind::Color, 0), profile },
            fo2,
        );
        let set = block.try_dequeue().unwrap();
        assert_eq!(set.len(), 2);
    }
}
