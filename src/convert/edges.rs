//! Sobel edge map over the luma plane, rendered as white edges on black.

use tracing::debug;

use crate::capture::frame::{RawFrame, Resolution};
use crate::convert::{ConvertError, Converter};

/// Gradient magnitude (luma normalized to 0..1) at which a pixel counts as an edge.
pub const DEFAULT_EDGE_THRESHOLD: f32 = 0.63;

#[derive(Debug)]
pub struct EdgeConverter {
    threshold: f32,
    resolution: Option<Resolution>,
}

impl Default for EdgeConverter {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_EDGE_THRESHOLD)
    }
}

impl EdgeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            resolution: None,
        }
    }
}

impl Converter for EdgeConverter {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
        debug!(%resolution, threshold = self.threshold, "edge converter ready");
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

        // Borders repeat the outermost sample
        let sample_y = |x: isize, y: isize| -> f32 {
            let x = x.clamp(0, width as isize - 1) as usize;
            let y = y.clamp(0, height as isize - 1) as usize;
            frame.y.sample(x, y) as f32 / 255.0
        };

        for (py, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
            for (px, out) in out_row.chunks_exact_mut(4).enumerate() {
                let x = px as isize;
                let y = py as isize;

                let tl = sample_y(x - 1, y - 1);
                let tm = sample_y(x, y - 1);
                let tr = sample_y(x + 1, y - 1);
                let ml = sample_y(x - 1, y);
                let mr = sample_y(x + 1, y);
                let bl = sample_y(x - 1, y + 1);
                let bm = sample_y(x, y + 1);
                let br = sample_y(x + 1, y + 1);

                let gx = -tl - 2.0 * ml - bl + tr + 2.0 * mr + br;
                let gy = -tl - 2.0 * tm - tr + bl + 2.0 * bm + br;
                let edge = (gx * gx + gy * gy).sqrt();

                let value = if edge >= self.threshold { 255 } else { 0 };
                out[..3].fill(value);
                out[3] = 255;
            }
        }

        Ok(rgba)
    }

    fn release(&mut self) {
        self.resolution = None;
    }
}
