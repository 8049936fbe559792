//! Frame buffers and the fixed-capacity pool that backs them. Grounded on
//! `uvc-streamer.cpp`'s `backend_frames_archive`/`backend_frame_ptr`: a
//! bounded set of reusable buffers, each checked out as a `Frame` and
//! returned to the pool (not freed) when dropped.

use std::sync::{Arc, Condvar, Mutex};

/// How many buffers the pool holds at once. Matches the original's fixed
/// `CAPACITY` — enough in-flight frames to cover one dequeue interval of
/// bulk payload reassembly without unbounded growth.
pub const CAPACITY: usize = 16;

/// Negotiated stream parameters, carried alongside every delivered frame
/// so a consumer doesn't need a side-channel to know resolution/format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: u32,
}

/// A decoded UVC payload ready for delivery: header-stripped pixel data
/// plus the original buffer it was sliced from (kept alive so the slice
/// stays valid). Mirrors the original's `frame_object` (size/pixels
/// pointer split from the owning buffer).
#[derive(Clone)]
pub struct FrameObject {
    pub frame_size: usize,
    pub metadata_size: usize,
    buffer: Arc<Vec<u8>>,
    data_offset: usize,
}

impl FrameObject {
    pub fn pixels(&self) -> &[u8] {
        &self.buffer[self.data_offset..self.data_offset + self.frame_size]
    }

    pub fn metadata(&self) -> &[u8] {
        &self.buffer[..self.metadata_size]
    }
}

struct PoolInner {
    live_count: usize,
    accepting: bool,
}

/// Fixed-capacity pool of reusable receive buffers. `allocate` blocks while
/// all `CAPACITY` buffers are checked out; `stop_allocation` +
/// `wait_until_empty` is how `stop()` waits for every in-flight frame to
/// drain before releasing endpoint resources.
pub struct FrameArchive {
    buffer_len: usize,
    inner: Mutex<PoolInner>,
    cv: Condvar,
}

/// A checked-out receive buffer. Returned to its archive automatically
/// when dropped.
pub struct Frame {
    pub buffer: Vec<u8>,
    archive: Arc<FrameArchive>,
}

impl FrameArchive {
    pub fn new(buffer_len: usize) -> Arc<Self> {
        Arc::new(FrameArchive {
            buffer_len,
            inner: Mutex::new(PoolInner { live_count: 0, accepting: true }),
            cv: Condvar::new(),
        })
    }

    /// Check out a buffer, blocking if the pool is at capacity. Returns
    /// `None` once `stop_allocation` has been called.
    pub fn allocate(self: &Arc<Self>) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.accepting {
                return None;
            }
            if inner.live_count < CAPACITY {
                inner.live_count += 1;
                break;
            }
            inner = self.cv.wait(inner).unwrap();
        }
        Some(Frame {
            buffer: vec![0u8; self.buffer_len],
            archive: self.clone(),
        })
    }

    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.live_count -= 1;
        self.cv.notify_all();
    }

    /// Stop handing out new buffers; already-checked-out frames still
    /// return normally.
    pub fn stop_allocation(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.accepting = false;
        self.cv.notify_all();
    }

    /// Block until every checked-out buffer has been returned.
    pub fn wait_until_empty(&self) {
        let inner = self.inner.lock().unwrap();
        let _unused = self.cv.wait_while(inner, |inner| inner.live_count > 0).unwrap();
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live_count
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.archive.release();
    }
}

impl Frame {
    /// Slice a payload out of this frame's buffer into a `FrameObject`,
    /// consuming the checked-out buffer (it is kept alive by the returned
    /// object rather than returned to the pool immediately — mirrors the
    /// original's `backend_frame_ptr` moved into the delivered
    /// `frame_object`).
    pub fn into_frame_object(mut self, metadata_size: usize, total_len: usize) -> FrameObject {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.truncate(total_len.max(metadata_size));
        // Release the pool slot now that the bytes are copied into the
        // Arc the FrameObject owns; mem::forget skips the Drop impl below
        // so the slot isn't released a second time.
        self.archive.release();
        std::mem::forget(self);
        FrameObject {
            frame_size: total_len.saturating_sub(metadata_size),
            metadata_size,
            buffer: Arc::new(buffer),
            data_offset: metadata_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_capacity() {
        let archive = FrameArchive::new(64);
        let mut frames = Vec::new();
        for _ in 0..CAPACITY {
            frames.push(archive.allocate().unwrap());
        }
        assert_eq!(archive.live_count(), CAPACITY);
        drop(frames);
        assert_eq!(archive.live_count(), 0);
    }

    #[test]
    fn stop_allocation_then_wait_until_empty() {
        let archive = FrameArchive::new(64);
        let frame = archive.allocate().unwrap();
        archive.stop_allocation();
        assert!(archive.allocate().is_none());
        drop(frame);
        archive.wait_until_empty();
        assert_eq!(archive.live_count(), 0);
    }

    #[test]
    fn frame_object_exposes_pixels_after_header() {
        let archive = FrameArchive::new(16);
        let mut frame = archive.allocate().unwrap();
        frame.buffer[0] = 2; // header_len
        frame.buffer[2] = 0xAA;
        let fo = frame.into_frame_object(2, 8);
        assert_eq!(fo.pixels()[0], 0xAA);
        assert_eq!(fo.frame_size, 6);
    }
}
