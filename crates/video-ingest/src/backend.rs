//! Decoder backend seam used by the reconnecting stream.

use link_core::AbortHandle;

use crate::types::{CaptureError, Frame};

/// An open decoder connection producing frames one at a time.
pub trait FrameSource: Send {
    /// Block until the next frame is decoded.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Advance past one frame without keeping it.
    fn grab(&mut self) -> Result<(), CaptureError> {
        self.read_frame().map(|_| ())
    }

    /// Hook that makes a blocked `read_frame` return promptly with an error.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    /// Release the connection.
    fn close(&mut self) {}
}

/// Factory for fresh connections to one camera.
pub trait SourceConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn FrameSource>, CaptureError>;

    /// Credential-free description for logs.
    fn describe(&self) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Device,
    Rtsp,
    Http,
    File,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Http
        } else if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }

    pub fn is_network(self) -> bool {
        matches!(self, SourceKind::Rtsp | SourceKind::Http)
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

/// Strip `user:password@` from a URI before it reaches a log line.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => uri.to_string(),
    }
}
