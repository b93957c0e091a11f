pub mod controller;

use thiserror::Error;

use crate::capture::frame::Resolution;
use crate::capture::CaptureError;
use crate::convert::ConvertError;
use crate::render::RenderError;

pub use controller::{PipelineController, PipelineStats};

/// Telemetry published by the capture side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineEvent {
    /// A session was configured; emitted before its first frame.
    ResolutionChanged(Resolution),
    /// Mean capture rate over the last estimator window, in frames per second.
    Fps(f64),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Render(#[from] RenderError),
}
