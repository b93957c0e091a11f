//! CPU converters from strided planar 4:2:0 to RGBA.

use tracing::debug;

use crate::capture::frame::{RawFrame, Resolution};
use crate::convert::{ConvertError, Converter};

/// BT.601 limited-range YUV to RGBA with 7-bit fixed-point coefficients.
///
/// Luma is expanded from 16..235 and chroma from 16..240 to full range.
#[derive(Debug, Default)]
pub struct Bt601Converter {
    resolution: Option<Resolution>,
}

impl Bt601Converter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Converter for Bt601Converter {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
        debug!(%resolution, "bt601 converter ready");
        self.resolution = Some(resolution);
        Ok(())
    }

    fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
        if self.resolution.is_none() {
            return Err(ConvertError::NotInitialized);
        }

        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let mut rgba = vec![0u8; width * height * 4];
        if rgba.is_empty() {
            return Ok(rgba);
        }

        for (row, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
            let chroma_row = row / 2;
            for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
                let u = frame.u.sample(col / 2, chroma_row) as i32 - 128;
                let v = frame.v.sample(col / 2, chroma_row) as i32 - 128;
                let y = ((frame.y.sample(col, row) as i32 - 16) * 149) >> 7;

                px[0] = (y + ((204 * v) >> 7)).clamp(0, 255) as u8;
                px[1] = (y - ((50 * u) >> 7) - ((104 * v) >> 7)).clamp(0, 255) as u8;
                px[2] = (y + ((258 * u) >> 7)).clamp(0, 255) as u8;
                px[3] = 255;
            }
        }

        Ok(rgba)
    }

    fn release(&mut self) {
        self.resolution = None;
    }
}

/// Luma only, replicated to R, G and B with opaque alpha.
#[derive(Debug, Default)]
pub struct GrayscaleConverter {
    resolution: Option<Resolution>,
}

impl GrayscaleConverter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Converter for GrayscaleConverter {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
        self.resolution = Some(resolution);
        Ok(())
    }

    fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
        if self.resolution.is_none() {
            return Err(ConvertError::NotInitialized);
        }

        let width = frame.width() as usize;
        let mut rgba = vec![255u8; width * frame.height() as usize * 4];
        if rgba.is_empty() {
            return Ok(rgba);
        }
        for (row, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
            for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
                let luma = frame.y.sample(col, row);
                px[..3].fill(luma);
            }
        }
        Ok(rgba)
    }

    fn release(&mut self) {
        self.resolution = None;
    }
}
