use std::{fmt, io};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel dimensions of a frame or of the reference space an ROI was drawn in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Decoded BGR8 frame.
///
/// Frames are published behind an `Arc` and never mutated afterwards, so the
/// display and detection paths can hold the same buffer.
pub struct Frame {
    pub data: Vec<u8>,
    pub resolution: Resolution,
    pub timestamp_ms: i64,
    /// Position in the stream's output, assigned on publish. Starts at 1.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a BGR8 buffer captured now.
    pub fn bgr8(data: Vec<u8>, resolution: Resolution) -> Self {
        Self {
            data,
            resolution,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: 0,
            format: FrameFormat::Bgr8,
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Expected buffer length for this frame's resolution and format.
    pub fn expected_len(&self) -> usize {
        self.resolution.pixel_count() * self.format.bytes_per_pixel()
    }

    /// Milliseconds elapsed between capture and `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp_ms).max(0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to launch decoder: {0}")]
    Spawn(#[source] io::Error),
    #[error("could not determine stream resolution for {uri:?}")]
    UnknownResolution { uri: String },
    #[error("video source ended")]
    EndOfStream,
    #[error("frame read failed: {0}")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_len_matches_bgr_layout() {
        let frame = Frame::bgr8(vec![0; 12], Resolution::new(2, 2));
        assert_eq!(frame.expected_len(), 12);
    }

    #[test]
    fn age_never_negative() {
        let mut frame = Frame::bgr8(Vec::new(), Resolution::new(1, 1));
        frame.timestamp_ms = 1_000;
        assert_eq!(frame.age_ms(1_250), 250);
        assert_eq!(frame.age_ms(900), 0);
    }

    #[test]
    fn resolution_display() {
        assert_eq!(Resolution::new(1920, 1080).to_string(), "1920x1080");
        assert!(Resolution::new(0, 1080).is_empty());
    }
}
