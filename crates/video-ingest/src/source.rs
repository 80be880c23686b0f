//! Reconnecting per-camera acquisition loop.
//!
//! One capture thread per camera owns the decoder connection. Frames are
//! published into a [`FrameSlot`]; connection problems never escape the loop,
//! they show up as [`ConnectionState`] transitions and the loop retries with
//! capped multiplicative backoff until stopped.

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::Receiver;
use link_core::{
    AbortSlot, Backoff, BackoffPolicy, ConnectionState, JoinError, StateCell, StatusEvent,
    StopHandle, StopToken, join_within, spawn_thread, stop_pair,
};
use tracing::{debug, info_span, warn};

use crate::{
    backend::{FrameSource, SourceConnector},
    slot::FrameSlot,
    types::{CaptureError, Frame},
    watchdog::{StreamHealth, spawn_stall_watchdog},
};

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Frames skipped before each kept frame.
    pub grab_count: u32,
    pub backoff: BackoffPolicy,
    /// Reconnect when a connected stream produces nothing for this long.
    pub stall_timeout: Option<Duration>,
    /// Upper bound on how long `stop` waits for the loop to exit.
    pub stop_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            grab_count: 1,
            backoff: BackoffPolicy::default(),
            stall_timeout: Some(Duration::from_secs(10)),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

struct StreamRuntime {
    stop: StopHandle,
    capture: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

pub struct ReconnectingStream {
    id: Arc<str>,
    connector: Arc<dyn SourceConnector>,
    options: StreamOptions,
    slot: Arc<FrameSlot>,
    state: Arc<StateCell>,
    health: Arc<StreamHealth>,
    abort: AbortSlot,
    runtime: Mutex<Option<StreamRuntime>>,
}

impl ReconnectingStream {
    pub fn new(
        id: impl Into<Arc<str>>,
        connector: Arc<dyn SourceConnector>,
        options: StreamOptions,
    ) -> Self {
        let id = id.into();
        Self {
            state: Arc::new(StateCell::new("camera", id.clone())),
            id,
            connector,
            options,
            slot: Arc::new(FrameSlot::new()),
            health: Arc::new(StreamHealth::new()),
            abort: AbortSlot::new(),
            runtime: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the acquisition loop. Calling it on a running stream is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            return Ok(());
        }

        let (stop, token) = stop_pair();
        let capture_loop = CaptureLoop {
            id: self.id.clone(),
            connector: self.connector.clone(),
            options: self.options.clone(),
            slot: self.slot.clone(),
            state: self.state.clone(),
            health: self.health.clone(),
            abort: self.abort.clone(),
            stop: token.clone(),
        };
        let capture = spawn_thread(format!("capture-{}", self.id), move || capture_loop.run())?;

        let watchdog = match self.options.stall_timeout {
            Some(timeout) => match spawn_stall_watchdog(
                self.id.clone(),
                self.health.clone(),
                self.state.clone(),
                self.abort.clone(),
                token,
                timeout,
            ) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    if let Err(join_err) = self.halt_capture(&stop, capture) {
                        warn!(camera = %self.id, "capture loop did not stop cleanly: {join_err}");
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        *runtime = Some(StreamRuntime {
            stop,
            capture,
            watchdog,
        });
        Ok(())
    }

    /// Stop the loop, interrupting any blocked read, and wait a bounded time
    /// for it to exit. Safe to call repeatedly or on a stream never started.
    pub fn stop(&self) -> Result<(), JoinError> {
        let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let capture = self.halt_capture(&runtime.stop, runtime.capture);
        let watchdog = match runtime.watchdog {
            Some(handle) => join_within(handle, self.options.stop_timeout),
            None => Ok(()),
        };
        self.state.transition(ConnectionState::Disconnected, None);
        capture.and(watchdog)
    }

    /// Signal the loop, interrupt its read and wait for it to exit.
    fn halt_capture(&self, stop: &StopHandle, capture: JoinHandle<()>) -> Result<(), JoinError> {
        stop.stop();
        self.abort.fire();
        join_within(capture, self.options.stop_timeout)
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Newest decoded frame, if any. Never blocks on the capture loop.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        self.state.subscribe()
    }

    pub fn frames_captured(&self) -> u64 {
        self.health.frames()
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }
}

impl Drop for ReconnectingStream {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(camera = %self.id, "capture loop did not stop cleanly: {err}");
        }
    }
}

struct CaptureLoop {
    id: Arc<str>,
    connector: Arc<dyn SourceConnector>,
    options: StreamOptions,
    slot: Arc<FrameSlot>,
    state: Arc<StateCell>,
    health: Arc<StreamHealth>,
    abort: AbortSlot,
    stop: StopToken,
}

impl CaptureLoop {
    fn run(self) {
        let span = info_span!("ingest.capture", camera = %self.id);
        let _enter = span.enter();

        let mut backoff = Backoff::new(self.options.backoff);
        let mut sequence = 0u64;

        while !self.stop.is_stopped() {
            self.state.transition(ConnectionState::Connecting, None);
            metrics::counter!("coalguard_stream_connect_attempts_total", "camera" => self.id.to_string())
                .increment(1);

            let mut source = match self.connector.connect() {
                Ok(source) => source,
                Err(err) => {
                    let delay = backoff.record_failure();
                    self.state
                        .transition(ConnectionState::Failed, Some(err.to_string()));
                    debug!(
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "camera connect failed; backing off"
                    );
                    if self.stop.sleep(delay) {
                        break;
                    }
                    continue;
                }
            };

            // Arm before checking the flag so a concurrent stop either sees
            // the hook or we see the flag.
            if let Some(handle) = source.abort_handle() {
                self.abort.arm(handle);
            }
            if self.stop.is_stopped() {
                self.abort.disarm();
                source.close();
                break;
            }

            backoff.reset();
            self.health.connected();
            self.state.transition(ConnectionState::Connected, None);

            let result = self.pump(source.as_mut(), &mut sequence);
            self.abort.disarm();
            source.close();

            let err = match result {
                Ok(()) => break,
                Err(_) if self.stop.is_stopped() => break,
                Err(err) => err,
            };
            let reason = if self.health.take_stall() {
                format!("stalled ({err})")
            } else {
                err.to_string()
            };
            self.state
                .transition(ConnectionState::Disconnected, Some(reason));
            metrics::counter!("coalguard_stream_disconnects_total", "camera" => self.id.to_string())
                .increment(1);
            if self.stop.sleep(backoff.current()) {
                break;
            }
        }

        self.state.transition(ConnectionState::Disconnected, None);
    }

    /// Read until an error or a stop request. `Ok` means stopped.
    fn pump(&self, source: &mut dyn FrameSource, sequence: &mut u64) -> Result<(), CaptureError> {
        while !self.stop.is_stopped() {
            for _ in 0..self.options.grab_count {
                source.grab()?;
            }
            let mut frame = source.read_frame()?;
            *sequence += 1;
            frame.sequence = *sequence;
            self.slot.publish(Arc::new(frame));
            self.health.beat();
            metrics::counter!("coalguard_frames_captured_total", "camera" => self.id.to_string())
                .increment(1);
        }
        Ok(())
    }
}
