use thiserror::Error;
use video_ingest::Frame;

use crate::Detection;

/// A failed inference on one frame. Recoverable: the caller skips the frame.
#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("invalid scorer input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Object detection or segmentation model, frame in, detections out.
///
/// Implementations are not assumed to be safe for concurrent use. Callers
/// that share one instance between cameras serialize access themselves.
pub trait Scorer: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, ScorerError>;

    /// Short name used in logs and metrics.
    fn name(&self) -> &str;
}

impl<S: Scorer + ?Sized> Scorer for Box<S> {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, ScorerError> {
        (**self).infer(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
