//! V4L2 capture backend streaming planar 4:2:0 through mmap buffers

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::{Metadata, Type};
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{
    CaptureBackend, CaptureSession, CompletedCapture, DeviceInfo, LensFacing,
};
use crate::capture::frame::{Plane, RawFrame, Resolution};
use crate::capture::CaptureError;

const MAX_NODES: u32 = 10;

/// Planar formats in order of preference.
const PLANAR_FORMATS: [&[u8; 4]; 2] = [b"YU12", b"NV12"];

pub struct V4l2Backend {
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
        }
    }

    fn preferred_fourcc(device: &Device) -> Result<Option<FourCC>, CaptureError> {
        let formats = device.enum_formats()?;
        Ok(PLANAR_FORMATS
            .iter()
            .map(|code| FourCC::new(code))
            .find(|fourcc| formats.iter().any(|f| f.fourcc == *fourcc)))
    }
}

impl CaptureBackend for V4l2Backend {
    fn devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let mut found = Vec::new();

        for i in 0..MAX_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            if !matches!(Self::preferred_fourcc(&dev), Ok(Some(_))) {
                debug!("{} has no planar 4:2:0 format, skipping", path);
                continue;
            }

            info!("Found capture device: {} - {}", path, caps.card);
            found.push(DeviceInfo {
                id: path,
                name: caps.card,
                // V4L2 does not report lens placement
                facing: LensFacing::External,
            });
        }

        Ok(found)
    }

    fn supported_sizes(&self, info: &DeviceInfo) -> Result<Vec<Resolution>, CaptureError> {
        let device = Device::with_path(&info.id)?;
        let Some(fourcc) = Self::preferred_fourcc(&device)? else {
            return Ok(Vec::new());
        };

        let mut sizes = Vec::new();
        for framesize in device.enum_framesizes(fourcc)? {
            match framesize.size {
                FrameSizeEnum::Discrete(d) => sizes.push(Resolution::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    sizes.push(Resolution::new(s.min_width, s.min_height));
                    sizes.push(Resolution::new(s.max_width, s.max_height));
                }
            }
        }
        Ok(sizes)
    }

    #[instrument(skip(self))]
    fn open(
        &self,
        info: &DeviceInfo,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let device = Device::with_path(&info.id)?;
        let fourcc = Self::preferred_fourcc(&device)?
            .ok_or_else(|| CaptureError::Session(format!("{} lost its planar format", info.id)))?;

        let mut fmt = device.format()?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.fourcc = fourcc;
        let fmt = device.set_format(&fmt)?;

        let layout = Layout::for_format(fmt.fourcc, fmt.stride as usize).ok_or_else(|| {
            CaptureError::Session(format!("driver negotiated unsupported format {}", fmt.fourcc))
        })?;
        let actual = Resolution::new(fmt.width, fmt.height);
        if actual != resolution {
            warn!(requested = %resolution, %actual, "driver adjusted capture size");
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| CaptureError::Session(format!("buffer allocation failed: {}", e)))?;
        info!(
            "Capture stream started with {} buffers ({} {})",
            self.buffer_count, fmt.fourcc, actual
        );

        let handle = device.handle();
        Ok(Box::new(V4l2Session {
            fd: handle.fd(),
            _handle: handle,
            stream,
            resolution: actual,
            layout,
            sequence: 0,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    /// Y, then U, then V; chroma rows are half the luma stride.
    I420 { y_stride: usize },
    /// Y, then interleaved UV at the luma stride.
    Nv12 { y_stride: usize },
}

impl Layout {
    fn for_format(fourcc: FourCC, stride: usize) -> Option<Self> {
        if fourcc == FourCC::new(b"YU12") {
            Some(Layout::I420 { y_stride: stride })
        } else if fourcc == FourCC::new(b"NV12") {
            Some(Layout::Nv12 { y_stride: stride })
        } else {
            None
        }
    }

    /// Copy the device buffer once, then split planes as zero-copy views.
    fn extract(
        &self,
        buf: &[u8],
        resolution: Resolution,
        sequence: u64,
        timestamp_ns: i64,
    ) -> Result<RawFrame, CaptureError> {
        let data = Bytes::copy_from_slice(buf);
        let h = resolution.height as usize;
        let ch = resolution.chroma().height as usize;

        let (y, u, v) = match *self {
            Layout::I420 { y_stride } => {
                let c_stride = y_stride / 2;
                let u_start = y_stride * h;
                let v_start = u_start + c_stride * ch;
                (
                    Plane::new(span(&data, 0, u_start), y_stride, 1),
                    Plane::new(span(&data, u_start, v_start), c_stride, 1),
                    Plane::new(span(&data, v_start, v_start + c_stride * ch), c_stride, 1),
                )
            }
            Layout::Nv12 { y_stride } => {
                let uv_start = y_stride * h;
                let uv_end = uv_start + y_stride * ch;
                (
                    Plane::new(span(&data, 0, uv_start), y_stride, 1),
                    Plane::new(span(&data, uv_start, uv_end), y_stride, 2),
                    Plane::new(span(&data, uv_start + 1, uv_end), y_stride, 2),
                )
            }
        };

        Ok(RawFrame::new(resolution, y, u, v, sequence, timestamp_ns)?)
    }
}

/// Clamped slice; short buffers are caught by plane validation.
fn span(data: &Bytes, start: usize, end: usize) -> Bytes {
    let end = end.min(data.len());
    data.slice(start.min(end)..end)
}

struct V4l2Session {
    // Declared before the handle so the stream unmaps first
    stream: MmapStream<'static>,
    fd: RawFd,
    _handle: Arc<Handle>,
    resolution: Resolution,
    layout: Layout,
    sequence: u64,
}

fn timestamp_ns(meta: &Metadata) -> i64 {
    micros_to_ns(meta.timestamp.sec as i64, meta.timestamp.usec as i64)
}

fn micros_to_ns(sec: i64, usec: i64) -> i64 {
    sec * 1_000_000_000 + usec * 1_000
}

/// Bytes the driver filled; drivers that leave `bytesused` at zero mean the whole buffer.
fn payload(buf: &[u8], bytesused: u32) -> &[u8] {
    match (bytesused as usize).min(buf.len()) {
        0 => buf,
        used => &buf[..used],
    }
}

/// Whether another dequeued buffer is ready without blocking.
fn buffer_ready(fd: RawFd) -> Result<bool, CaptureError> {
    // SAFETY: the session keeps the device handle, and with it the fd, open
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ready = poll(&mut fds, PollTimeout::ZERO).map_err(io::Error::from)?;
    Ok(ready > 0)
}

impl CaptureSession for V4l2Session {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn next_capture(&mut self, timeout: Duration) -> Result<Option<CompletedCapture>, CaptureError> {
        self.stream.set_timeout(timeout);

        let mut timestamps_ns = Vec::with_capacity(2);
        loop {
            let (buf, meta) = match self.stream.next() {
                Ok(next) => next,
                Err(e) if e.kind() == io::ErrorKind::TimedOut && timestamps_ns.is_empty() => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            let ts = timestamp_ns(meta);
            timestamps_ns.push(ts);

            // Requeue this one untouched if a newer capture already completed
            if buffer_ready(self.fd)? {
                continue;
            }

            let frame =
                self.layout
                    .extract(payload(buf, meta.bytesused), self.resolution, self.sequence, ts)?;
            self.sequence += 1;

            return Ok(Some(CompletedCapture {
                frame,
                timestamps_ns,
            }));
        }
    }
}
