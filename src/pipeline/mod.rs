//! Pipeline/streamer façade (spec.md §4.F): the top-level `start`/`stop`
//! API applications use, wrapping one or more `UvcStreamer`s and routing
//! their output to per-stream callbacks. Grounded on
//! `streamer.h`/`streamer.cpp`'s `streamer` base class — a mutex-guarded
//! active profile, `start()`/`stop()` guarded against re-entry, and a
//! `get_callback()` hook subclasses override to change delivery semantics
//! (§4.F's async vs sync variants).

pub mod async_streamer;
pub mod config;
pub mod sync_streamer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use crate::frame::{FrameObject, StreamProfile};
use crate::usb::device::UsbMessenger;
use crate::uvc::{StreamCtrl, UvcStreamer, UvcStreamerContext};

pub use config::{Config, StreamKind, StreamSelector};

const MAX_RESOLVE_ATTEMPTS: u32 = 3;
const RESOLVE_ATTEMPT_BUDGET: Duration = Duration::from_secs(5);

/// Resolve one requested stream's config against the hub, retrying
/// transient failures up to `MAX_RESOLVE_ATTEMPTS` times with a
/// `RESOLVE_ATTEMPT_BUDGET`-second budget per attempt. An attempt that
/// runs past its budget before failing is treated as non-transient (the
/// hub is probably wedged, not racing enumeration) and stops the retry
/// loop early.
fn resolve_with_retry(
    open_stream: &mut impl FnMut(StreamSelector, Option<&StreamProfile>) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)>,
    selector: StreamSelector,
    requested_profile: Option<&StreamProfile>,
) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)> {
    let mut last_err = None;
    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        let started = Instant::now();
        match open_stream(selector, requested_profile) {
            Ok(result) => return Ok(result),
            Err(e) => {
                let within_budget = started.elapsed() < RESOLVE_ATTEMPT_BUDGET;
                eprintln!(
                    "resolving stream {selector:?} against the hub failed (attempt {attempt}/{MAX_RESOLVE_ATTEMPTS}): {e:?}"
                );
                last_err = Some(e);
                if !within_budget {
                    break;
                }
            }
        }
    }
    Err(last_err.unwrap())
}

/// A negotiated, running stream: its profile and the engine delivering
/// its frames.
pub struct ActiveStream {
    pub selector: StreamSelector,
    pub profile: StreamProfile,
    streamer: UvcStreamer,
}

/// The set of streams started by the most recent `start()` call.
#[derive(Default)]
pub struct ActiveProfile {
    pub streams: Vec<(StreamSelector, StreamProfile)>,
}

struct State {
    active: Option<ActiveProfile>,
    prev_config: Option<Config>,
    running_streams: Vec<ActiveStream>,
}

/// Per-stream frame delivery callback.
pub type FrameCallback = Arc<dyn Fn(FrameProfile, FrameObject) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct FrameProfile {
    pub selector: StreamSelector,
    pub profile: StreamProfile,
}

/// Shared base behind both delivery modes: owns the active profile and
/// the started `UvcStreamer`s, but defers "what happens to a frame once
/// it's decoded" to the subtype via `Streamer::route`.
pub struct Streamer {
    state: Mutex<State>,
    callbacks: Mutex<HashMap<StreamSelector, FrameCallback>>,
}

impl Streamer {
    pub fn new() -> Self {
        Streamer {
            state: Mutex::new(State {
                active: None,
                prev_config: None,
                running_streams: Vec::new(),
            }),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_callback(&self, selector: StreamSelector, callback: FrameCallback) {
        self.callbacks.lock().unwrap().insert(selector, callback);
    }

    /// Resolution order for an incoming frame: exact `(kind, index)`,
    /// then `(kind, -1)`, then the `(Any, -1)` catch-all. Frames with no
    /// match are dropped, mirroring `async_streamer::get_callback`.
    pub fn resolve_callback(&self, selector: StreamSelector) -> Option<FrameCallback> {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = callbacks.get(&selector) {
            return Some(cb.clone());
        }
        if let Some(cb) = callbacks.get(&StreamSelector::wildcard_for(selector.kind)) {
            return Some(cb.clone());
        }
        callbacks.get(&StreamSelector::ANY).cloned()
    }

    pub fn get_active_profile(&self) -> Result<ActiveProfile> {
        let state = self.state.lock().unwrap();
        match &state.active {
            Some(profile) => Ok(ActiveProfile { streams: profile.streams.clone() }),
            None => bail!("get_active_profile() can only be called between a start() and a following stop()"),
        }
    }

    /// Start streaming per `config`, opening one `UvcStreamer` per
    /// requested stream against `open_stream`. `on_frame` is called from
    /// whichever worker thread a `UvcStreamer` delivers on; it should be
    /// cheap (route to a queue, not do heavy processing).
    pub fn start(
        &self,
        config: Config,
        mut open_stream: impl FnMut(StreamSelector, Option<&StreamProfile>) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)>,
        on_frame: impl Fn(FrameProfile, FrameObject) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.active.is_some() {
            bail!("start() cannot be called before stop()");
        }

        let on_frame = Arc::new(on_frame);
        let mut streams = Vec::new();
        let mut running = Vec::new();

        for (selector, requested_profile) in config.requested_streams() {
            let (profile, messenger, endpoint, control) =
                resolve_with_retry(&mut open_stream, selector, requested_profile)?;
            let profile_for_cb = profile.clone();
            let on_frame_cb = on_frame.clone();
            let user_cb: Arc<dyn Fn(StreamProfile, FrameObject) + Send + Sync> = Arc::new(move |p, fo| {
                on_frame_cb(FrameProfile { selector, profile: p }, fo);
            });
            let streamer = UvcStreamer::new(UvcStreamerContext {
                profile: profile.clone(),
                user_cb,
                control,
                messenger,
                endpoint,
                request_count: 4,
            });
            streamer.start();
            streams.push((selector, profile_for_cb));
            running.push(ActiveStream { selector, profile, streamer });
        }

        state.active = Some(ActiveProfile { streams });
        state.running_streams = running;
        state.prev_config = Some(config);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        for stream in state.running_streams.drain(..) {
            stream.streamer.stop();
        }
        state.active = None;
    }

    /// Re-run `start()` with the configuration from the previous
    /// successful call, used by the sync streamer's reconnect path.
    pub fn restart_with_previous_config(
        &self,
        open_stream: impl FnMut(StreamSelector, Option<&StreamProfile>) -> Result<(StreamProfile, Arc<dyn UsbMessenger>, u8, StreamCtrl)>,
        on_frame: impl Fn(FrameProfile, FrameObject) + Send + Sync + 'static,
    ) -> Result<()> {
        let prev = self.state.lock().unwrap().prev_config.clone();
        let Some(prev) = prev else {
            bail!("no previous configuration to restart from");
        };
        self.stop();
        self.start(prev, open_stream, on_frame)
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Streamer::new()
    }
}
