//! Deterministic in-process camera for demos and tests.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::capture::device::{
    CaptureBackend, CaptureSession, CompletedCapture, DeviceInfo, LensFacing,
};
use crate::capture::frame::{Plane, RawFrame, Resolution};
use crate::capture::CaptureError;
use crate::SyntheticConfig;

/// First hardware timestamp of every session.
const EPOCH_NS: i64 = 1_000_000;
const ROW_ALIGN: usize = 16;

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    active: AtomicUsize,
    failing_opens: AtomicU32,
}

/// Produces a moving YUV 4:2:0 gradient with exact, evenly spaced timestamps.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    devices: Vec<DeviceInfo>,
    sizes: Vec<Resolution>,
    frame_interval: Duration,
    captures_per_wake: u32,
    interleaved_chroma: bool,
    counters: Arc<Counters>,
}

impl SyntheticCamera {
    pub fn new(sizes: impl IntoIterator<Item = Resolution>) -> Self {
        Self {
            devices: vec![
                DeviceInfo {
                    id: "synthetic-front".into(),
                    name: "Synthetic front camera".into(),
                    facing: LensFacing::Front,
                },
                DeviceInfo {
                    id: "synthetic-back".into(),
                    name: "Synthetic rear camera".into(),
                    facing: LensFacing::Back,
                },
            ],
            sizes: sizes.into_iter().collect(),
            frame_interval: Duration::from_nanos(1_000_000_000 / 30),
            captures_per_wake: 1,
            interleaved_chroma: false,
            counters: Arc::default(),
        }
    }

    pub fn from_config(config: &SyntheticConfig) -> Self {
        Self::new(config.sizes.iter().copied().map(Resolution::from))
            .with_fps(config.fps)
            .with_captures_per_wake(config.captures_per_wake)
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.frame_interval = Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)));
        self
    }

    /// Complete `n` captures per wake-up so all but the last are superseded.
    pub fn with_captures_per_wake(mut self, n: u32) -> Self {
        self.captures_per_wake = n.max(1);
        self
    }

    pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
        self.devices = devices;
        self
    }

    /// Emit NV12-style chroma: one interleaved buffer, pixel stride 2.
    pub fn with_interleaved_chroma(mut self, interleaved: bool) -> Self {
        self.interleaved_chroma = interleaved;
        self
    }

    /// Make the next `n` calls to `open` fail with a session error.
    pub fn fail_opens(&self, n: u32) {
        self.counters.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn sessions_opened(&self) -> u64 {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for SyntheticCamera {
    fn devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(self.devices.clone())
    }

    fn supported_sizes(&self, _device: &DeviceInfo) -> Result<Vec<Resolution>, CaptureError> {
        Ok(self.sizes.clone())
    }

    #[instrument(skip(self))]
    fn open(
        &self,
        device: &DeviceInfo,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let failing = self
            .counters
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(CaptureError::Session(format!(
                "{} refused configuration",
                device.id
            )));
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        debug!(%device, %resolution, "synthetic session opened");

        Ok(Box::new(SyntheticSession {
            resolution,
            frame_interval: self.frame_interval,
            captures_per_wake: self.captures_per_wake,
            interleaved_chroma: self.interleaved_chroma,
            next_due: Instant::now(),
            sequence: 0,
            counters: self.counters.clone(),
        }))
    }
}

struct SyntheticSession {
    resolution: Resolution,
    frame_interval: Duration,
    captures_per_wake: u32,
    interleaved_chroma: bool,
    next_due: Instant,
    sequence: u64,
    counters: Arc<Counters>,
}

impl SyntheticSession {
    fn timestamp_of(&self, sequence: u64) -> i64 {
        EPOCH_NS + self.frame_interval.as_nanos() as i64 * sequence as i64
    }

    fn render(&self, sequence: u64) -> Result<RawFrame, CaptureError> {
        let Resolution { width, height } = self.resolution;
        let (w, h) = (width as usize, height as usize);
        let chroma = self.resolution.chroma();
        let (cw, ch) = (chroma.width as usize, chroma.height as usize);
        let shift = (sequence * 4) as usize;

        let y_stride = w.next_multiple_of(ROW_ALIGN);
        let mut y = vec![0u8; y_stride * h];
        for row in 0..h {
            for col in 0..w {
                y[row * y_stride + col] = ((col + row + shift) & 0xff) as u8;
            }
        }

        let u_at = |col: usize, _row: usize| (64 + (col * 128) / cw.max(1)) as u8;
        let v_at = |_col: usize, row: usize| (64 + (row * 128) / ch.max(1)) as u8;

        let (u, v) = if self.interleaved_chroma {
            let stride = (cw * 2).next_multiple_of(ROW_ALIGN);
            let mut uv = vec![0u8; stride * ch];
            for row in 0..ch {
                for col in 0..cw {
                    uv[row * stride + col * 2] = u_at(col, row);
                    uv[row * stride + col * 2 + 1] = v_at(col, row);
                }
            }
            let uv = Bytes::from(uv);
            (
                Plane::new(uv.clone(), stride, 2),
                Plane::new(uv.slice(1..), stride, 2),
            )
        } else {
            let stride = cw.next_multiple_of(ROW_ALIGN);
            let mut u = vec![0u8; stride * ch];
            let mut v = vec![0u8; stride * ch];
            for row in 0..ch {
                for col in 0..cw {
                    u[row * stride + col] = u_at(col, row);
                    v[row * stride + col] = v_at(col, row);
                }
            }
            (Plane::new(u, stride, 1), Plane::new(v, stride, 1))
        };

        Ok(RawFrame::new(
            self.resolution,
            Plane::new(y, y_stride, 1),
            u,
            v,
            sequence,
            self.timestamp_of(sequence),
        )?)
    }
}

impl CaptureSession for SyntheticSession {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn next_capture(&mut self, timeout: Duration) -> Result<Option<CompletedCapture>, CaptureError> {
        let wake_interval = self.frame_interval * self.captures_per_wake;
        let now = Instant::now();
        if now < self.next_due {
            std::thread::sleep((self.next_due - now).min(timeout));
            if Instant::now() < self.next_due {
                return Ok(None);
            }
        }
        self.next_due += wake_interval;

        let first = self.sequence;
        self.sequence += u64::from(self.captures_per_wake);
        let newest = self.sequence - 1;

        let timestamps_ns = (first..=newest).map(|s| self.timestamp_of(s)).collect();
        Ok(Some(CompletedCapture {
            frame: self.render(newest)?,
            timestamps_ns,
        }))
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}
