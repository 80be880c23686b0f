//! Model-facing types: what a scorer returns and the trait every scorer
//! implements, plus the mask tracing segmentation scorers share. Enable the
//! `with-tch` feature for the TorchScript scorer.

mod detection;
pub mod mask;
mod scorer;
#[cfg(feature = "with-tch")]
mod torch;

pub use detection::{Detection, Point, Shape};
pub use mask::InstanceMask;
pub use scorer::{Scorer, ScorerError};
#[cfg(feature = "with-tch")]
pub use torch::{TorchScorer, TorchScorerOptions};

#[cfg(feature = "with-tch")]
pub use tch;
