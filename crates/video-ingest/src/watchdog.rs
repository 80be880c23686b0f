//! Stall detection for connected streams.
//!
//! A decoder can sit on a half-open socket for a long time without returning
//! an error. The capture loop beats on every published frame; when a connected
//! stream stays silent past the stall timeout the watchdog fires the
//! connection's abort hook so the blocked read fails and the loop reconnects.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use link_core::{AbortSlot, ConnectionState, StateCell, StopToken, spawn_thread};
use tracing::{debug, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) struct StreamHealth {
    origin: Instant,
    last_beat_ms: AtomicU64,
    frames: AtomicU64,
    stalled: AtomicBool,
}

impl StreamHealth {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// A fresh connection gets a full stall window before its first frame.
    pub(crate) fn connected(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.last_beat_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn beat(&self) {
        self.last_beat_ms.store(self.now_ms(), Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn silence(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Returns true only for the first call after a connect.
    fn mark_stalled(&self) -> bool {
        self.stalled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Consume the stalled flag set by the watchdog, if any.
    pub(crate) fn take_stall(&self) -> bool {
        self.stalled.swap(false, Ordering::SeqCst)
    }
}

pub(crate) fn spawn_stall_watchdog(
    camera: Arc<str>,
    health: Arc<StreamHealth>,
    state: Arc<StateCell>,
    abort: AbortSlot,
    stop: StopToken,
    stall_timeout: Duration,
) -> io::Result<JoinHandle<()>> {
    let poll = (stall_timeout / 4).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
    spawn_thread(format!("stall-{camera}"), move || {
        while !stop.sleep(poll) {
            if state.get() != ConnectionState::Connected {
                continue;
            }
            let silence = health.silence();
            if silence > stall_timeout && health.mark_stalled() {
                warn!(
                    camera = %camera,
                    silent_ms = silence.as_millis() as u64,
                    "stream stalled; forcing reconnect"
                );
                metrics::counter!("coalguard_stream_stalls_total", "camera" => camera.to_string())
                    .increment(1);
                if !abort.fire() {
                    debug!(camera = %camera, "source has no abort hook; waiting on its read timeout");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn stall_flag_fires_once_per_connection() {
        let health = StreamHealth::new();
        health.connected();
        assert!(health.mark_stalled());
        assert!(!health.mark_stalled());
        assert!(health.take_stall());
        health.connected();
        assert!(health.mark_stalled());
    }

    #[test]
    fn beats_reset_silence() {
        let health = StreamHealth::new();
        health.connected();
        thread::sleep(Duration::from_millis(30));
        assert!(health.silence() >= Duration::from_millis(20));
        health.beat();
        assert!(health.silence() < Duration::from_millis(20));
        assert_eq!(health.frames(), 1);
    }
}
