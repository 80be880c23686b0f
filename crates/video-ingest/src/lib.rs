//! Video acquisition for the monitor: decoder backends behind the
//! [`SourceConnector`] seam and the [`ReconnectingStream`] that keeps one
//! camera connected and its newest frame available.

mod backend;
#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod slot;
mod source;
mod types;
mod watchdog;

pub use backend::{FrameSource, SourceConnector, SourceKind, redact_uri};
#[cfg(feature = "opencv")]
pub use camera::{OpencvConnector, OpencvOptions};
pub use ffmpeg::{FfmpegConnector, FfmpegOptions};
pub use slot::FrameSlot;
pub use source::{ReconnectingStream, StreamOptions};
pub use types::{CaptureError, Frame, FrameFormat, Resolution};
