//! Test doubles for the conversion and display boundaries.

use std::time::Duration;

use bytes::Bytes;

use crate::capture::frame::{Plane, RawFrame, Resolution};
use crate::convert::{ConvertError, Converter, ProcessedFrame};
use crate::render::{FrameRenderer, RenderError};

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `debug`. Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Tightly packed 4:2:0 frame; luma encodes the position and `sequence`.
pub fn synthetic_frame(resolution: Resolution, sequence: u64) -> RawFrame {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let chroma = resolution.chroma();
    let chroma_len = chroma.width as usize * chroma.height as usize;

    let y: Vec<u8> = (0..w * h)
        .map(|i| (i as u64).wrapping_add(sequence) as u8)
        .collect();

    RawFrame::new(
        resolution,
        Plane::new(y, w, 1),
        Plane::new(vec![128u8; chroma_len], chroma.width as usize, 1),
        Plane::new(vec![128u8; chroma_len], chroma.width as usize, 1),
        sequence,
        sequence as i64 * 33_333_333,
    )
    .expect("tightly packed planes are always long enough")
}

pub fn processed_frame(resolution: Resolution, sequence: u64) -> ProcessedFrame {
    ProcessedFrame {
        resolution,
        rgba: Bytes::from(vec![0u8; resolution.rgba_len()]),
        conversion_time: Duration::ZERO,
        sequence,
    }
}

/// Deterministic fake: every output channel, alpha included, is the luma sample.
#[derive(Debug, Default)]
pub struct LumaFillConverter {
    resolution: Option<Resolution>,
    inits: Vec<Resolution>,
    releases: usize,
}

impl LumaFillConverter {
    pub fn inits(&self) -> &[Resolution] {
        &self.inits
    }

    pub fn releases(&self) -> usize {
        self.releases
    }
}

impl Converter for LumaFillConverter {
    fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
        self.resolution = Some(resolution);
        self.inits.push(resolution);
        Ok(())
    }

    fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
        if self.resolution.is_none() {
            return Err(ConvertError::NotInitialized);
        }
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let mut rgba = Vec::with_capacity(w * h * 4);
        for row in 0..h {
            for col in 0..w {
                rgba.extend_from_slice(&[frame.y.sample(col, row); 4]);
            }
        }
        Ok(rgba)
    }

    fn release(&mut self) {
        self.resolution = None;
        self.releases += 1;
    }
}

/// Records what would have reached the screen.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    texture: Option<(u64, Resolution)>,
    current: Option<u64>,
    drawn: Vec<u64>,
    uploads: usize,
    fail_next_upload: bool,
}

impl RecordingRenderer {
    pub fn fail_next_upload(&mut self) {
        self.fail_next_upload = true;
    }

    /// Sequences in the order they were drawn.
    pub fn drawn(&self) -> Vec<u64> {
        self.drawn.clone()
    }

    pub fn draw_calls(&self) -> usize {
        self.drawn.len()
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    /// Sequence of the frame currently on screen.
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub fn texture_size(&self) -> Option<Resolution> {
        self.texture.map(|(_, res)| res)
    }
}

impl FrameRenderer for RecordingRenderer {
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
        if std::mem::take(&mut self.fail_next_upload) {
            return Err(RenderError::Upload("injected failure".into()));
        }
        if frame.rgba.len() != frame.resolution.rgba_len() {
            return Err(RenderError::Upload(format!(
                "{} bytes for {}",
                frame.rgba.len(),
                frame.resolution
            )));
        }
        self.uploads += 1;
        self.texture = Some((frame.sequence, frame.resolution));
        Ok(())
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        let Some((sequence, _)) = self.texture else {
            return Err(RenderError::Surface("draw before first upload".into()));
        };
        self.current = Some(sequence);
        self.drawn.push(sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_fill_round_trip_has_exact_size() {
        let res = Resolution::new(7, 5);
        let frame = synthetic_frame(res, 3);
        let mut conv = LumaFillConverter::default();
        conv.init(res).unwrap();

        let rgba = conv.convert(&frame).unwrap();
        assert_eq!(rgba.len(), 7 * 5 * 4);
        let px = &rgba[4 * 8..4 * 9];
        assert_eq!(px, [frame.y.sample(1, 1); 4]);
    }
}
