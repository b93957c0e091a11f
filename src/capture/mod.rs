pub mod device;
pub mod fps;
pub mod frame;
pub mod resolution;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use thiserror::Error;

pub use device::{CaptureBackend, CaptureSession, CompletedCapture, DeviceInfo, LensFacing};
pub use fps::FrameRateEstimator;
pub use frame::{FrameError, Plane, RawFrame, Resolution};
pub use source::{FrameConsumer, FrameSource, SourceStats};
pub use synthetic::SyntheticCamera;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device available{}", .0.as_deref().map(|id| format!(" with id {id}")).unwrap_or_default())]
    NoDevice(Option<String>),
    #[error("capture session configuration failed: {0}")]
    Session(String),
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame source was released")]
    Released,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to spawn capture worker: {0}")]
    Worker(std::io::Error),
}
