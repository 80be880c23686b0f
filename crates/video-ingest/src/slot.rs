use std::sync::{Arc, Mutex, PoisonError};

use crate::types::Frame;

/// Single-entry mailbox holding the newest frame.
///
/// Publishing replaces the previous frame wholesale. Readers get an `Arc` to
/// whichever frame was current when they looked, never a partially written one.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Arc<Frame>) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
