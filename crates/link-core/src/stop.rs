//! Cooperative stop signals and hooks for interrupting blocking I/O.
//!
//! A [`StopToken`] wakes any thread parked in [`StopToken::sleep`] the moment
//! the paired [`StopHandle`] fires, because dropping the only sender
//! disconnects the channel. Blocking reads cannot observe the token, so links
//! also publish an [`AbortHandle`] into an [`AbortSlot`] that the stopper fires
//! to close the socket or kill the decoder process underneath the read.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

/// Callback that interrupts an in-flight blocking call.
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// Create a connected stop handle/token pair.
pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = bounded(0);
    let flag = Arc::new(AtomicBool::new(false));
    (
        StopHandle {
            tx: Mutex::new(Some(tx)),
            flag: flag.clone(),
        },
        StopToken { rx, flag },
    )
}

/// Owner side of a stop signal. Dropping it also signals stop.
pub struct StopHandle {
    tx: Mutex<Option<Sender<()>>>,
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Observer side of a stop signal, cloned into every worker loop.
#[derive(Clone)]
pub struct StopToken {
    rx: Receiver<()>,
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until stopped. Returns true if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_stopped(),
            _ => true,
        }
    }

    /// Sleep until `deadline` or until stopped. Returns true if stopped.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        self.sleep(deadline.saturating_duration_since(Instant::now()))
    }

    /// Channel that becomes disconnected on stop, for use in `select!`.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Holder for the abort hook of whatever connection is currently open.
#[derive(Clone, Default)]
pub struct AbortSlot(Arc<Mutex<Option<AbortHandle>>>);

impl AbortSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, handle: AbortHandle) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn disarm(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Invoke the armed hook, if any. Returns whether one was armed.
    pub fn fire(&self) -> bool {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handle) => {
                handle();
                true
            }
            None => false,
        }
    }
}
