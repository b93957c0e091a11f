pub mod edges;
pub mod stage;
pub mod yuv;

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::capture::frame::{FrameError, RawFrame, Resolution};

pub use edges::EdgeConverter;
pub use stage::{ConversionHandle, ConversionStage, ConversionStats};
pub use yuv::{Bt601Converter, GrayscaleConverter};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("converter used before init")]
    NotInitialized,
    #[error("converter produced {actual} bytes, expected {expected}")]
    OutputSize { expected: usize, actual: usize },
    #[error(transparent)]
    Plane(#[from] FrameError),
    #[error("conversion worker unavailable: {0}")]
    Worker(String),
}

/// Planar 4:2:0 to packed RGBA.
///
/// Implementations need not be reentrant: the conversion stage calls
/// `init`, `convert` and `release` from a single worker thread, one at a time.
pub trait Converter: Send {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError>;

    /// Returns exactly `width * height * 4` bytes.
    fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError>;

    fn release(&mut self);
}

impl<C: Converter + ?Sized> Converter for Box<C> {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
        (**self).init(resolution)
    }

    fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
        (**self).convert(frame)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// A packed RGBA frame ready for texture upload.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub resolution: Resolution,
    pub rgba: Bytes,
    pub conversion_time: Duration,
    /// Capture sequence of the source frame.
    pub sequence: u64,
}

impl ProcessedFrame {
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}
