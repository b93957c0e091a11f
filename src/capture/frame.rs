use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output size of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes in a tightly packed RGBA buffer of this size.
    pub const fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Dimensions of a 4:2:0 chroma plane.
    pub const fn chroma(&self) -> Resolution {
        Resolution::new(self.width.div_ceil(2), self.height.div_ceil(2))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Y,
    U,
    V,
}

impl fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaneKind::Y => "Y",
            PlaneKind::U => "U",
            PlaneKind::V => "V",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{plane} plane holds {actual} bytes, {required} needed for {cols}x{rows} samples")]
    PlaneTooShort {
        plane: PlaneKind,
        cols: u32,
        rows: u32,
        required: usize,
        actual: usize,
    },
    #[error("{plane} plane has zero pixel stride")]
    ZeroPixelStride { plane: PlaneKind },
}

/// One color plane with its device-reported layout.
///
/// `row_stride` and `pixel_stride` are authoritative: rows may be padded and
/// samples may be interleaved with another plane (NV12 chroma).
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride,
        }
    }

    /// Minimum length covering the last sample of a `cols` x `rows` plane.
    pub fn required_len(&self, cols: u32, rows: u32) -> usize {
        if cols == 0 || rows == 0 {
            return 0;
        }
        self.row_stride * (rows as usize - 1) + self.pixel_stride * (cols as usize - 1) + 1
    }

    /// Sample at column `x`, row `y`. Callers validate bounds through `RawFrame::new`.
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.row_stride + x * self.pixel_stride]
    }

    fn validate(&self, kind: PlaneKind, size: Resolution) -> Result<(), FrameError> {
        if self.pixel_stride == 0 {
            return Err(FrameError::ZeroPixelStride { plane: kind });
        }
        let required = self.required_len(size.width, size.height);
        if self.data.len() < required {
            return Err(FrameError::PlaneTooShort {
                plane: kind,
                cols: size.width,
                rows: size.height,
                required,
                actual: self.data.len(),
            });
        }
        Ok(())
    }
}

/// A planar 4:2:0 frame copied out of a capture device buffer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub resolution: Resolution,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
    pub sequence: u64,
    /// Hardware timestamp, nanoseconds from a device-defined monotonic origin.
    pub timestamp_ns: i64,
}

impl RawFrame {
    pub fn new(
        resolution: Resolution,
        y: Plane,
        u: Plane,
        v: Plane,
        sequence: u64,
        timestamp_ns: i64,
    ) -> Result<Self, FrameError> {
        y.validate(PlaneKind::Y, resolution)?;
        let chroma = resolution.chroma();
        u.validate(PlaneKind::U, chroma)?;
        v.validate(PlaneKind::V, chroma)?;

        Ok(Self {
            resolution,
            y,
            u,
            v,
            sequence,
            timestamp_ns,
        })
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}
