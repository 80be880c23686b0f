//! OpenCV-backed capture, available with the `opencv` feature.

use std::time::Duration;

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    backend::{FrameSource, SourceConnector, parse_device_index, redact_uri},
    types::{CaptureError, Frame, Resolution},
};

#[derive(Clone, Debug)]
pub struct OpencvOptions {
    /// Scale frames to this size; keep the native size when unset.
    pub output: Option<Resolution>,
    /// Driver-side queue depth. 1 keeps at most one stale frame in flight.
    pub buffer_size: u32,
    pub open_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for OpencvOptions {
    fn default() -> Self {
        Self {
            output: None,
            buffer_size: 1,
            open_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
        }
    }
}

pub struct OpencvConnector {
    uri: String,
    options: OpencvOptions,
}

impl OpencvConnector {
    pub fn new(uri: impl Into<String>, options: OpencvOptions) -> Self {
        Self {
            uri: uri.into(),
            options,
        }
    }
}

impl SourceConnector for OpencvConnector {
    fn connect(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let mut cap = open_video_capture(&self.uri, &self.options)?;
        configure_capture(&mut cap, &self.options);
        Ok(Box::new(OpencvSource {
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            output: self.options.output,
        }))
    }

    fn describe(&self) -> String {
        format!("opencv:{}", redact_uri(&self.uri))
    }
}

struct OpencvSource {
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    output: Option<Resolution>,
}

fn cv_err(err: opencv::Error) -> CaptureError {
    CaptureError::Other(err.into())
}

impl FrameSource for OpencvSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.cap.read(&mut self.frame).map_err(cv_err)? {
            return Err(CaptureError::EndOfStream);
        }
        let size = self.frame.size().map_err(cv_err)?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EndOfStream);
        }

        let native = Resolution::new(size.width as u32, size.height as u32);
        let target = self.output.unwrap_or(native);
        let working = if target != native {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target.width as i32,
                    height: target.height as i32,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(cv_err)?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working.data_bytes().map_err(cv_err)?.to_vec();
        Ok(Frame::bgr8(data, target))
    }

    /// Skip a frame without decoding it.
    fn grab(&mut self) -> Result<(), CaptureError> {
        if self.cap.grab().map_err(cv_err)? {
            Ok(())
        } else {
            Err(CaptureError::EndOfStream)
        }
    }

    fn close(&mut self) {
        let _ = self.cap.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str, options: &OpencvOptions) -> Result<VideoCapture, CaptureError> {
    let params = core::Vector::<i32>::from_slice(&[
        videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
        options.open_timeout.as_millis() as i32,
        videoio::CAP_PROP_READ_TIMEOUT_MSEC,
        options.read_timeout.as_millis() as i32,
    ]);

    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new_with_params(index, backend, &params) {
                Ok(cap) if cap.is_opened().map_err(cv_err)? => return Ok(cap),
                Ok(_) => {}
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file_with_params(uri, backend, &params) {
            Ok(cap) if cap.is_opened().map_err(cv_err)? => return Ok(cap),
            Ok(_) => {}
            Err(err) => {
                warn!(
                    "failed to open {} with backend {backend}: {err}",
                    redact_uri(uri)
                );
            }
        }
    }

    Err(CaptureError::Open {
        uri: redact_uri(uri),
    })
}

fn configure_capture(cap: &mut VideoCapture, options: &OpencvOptions) {
    match cap.set(videoio::CAP_PROP_BUFFERSIZE, options.buffer_size as f64) {
        Ok(true) => {}
        _ => debug!("capture backend ignored CAP_PROP_BUFFERSIZE"),
    }
    if let Some(size) = options.output {
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, size.width as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, size.height as f64);
    }
}
