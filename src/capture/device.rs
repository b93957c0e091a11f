//! Capture device boundary.

use std::fmt;
use std::time::Duration;

use crate::capture::frame::{RawFrame, Resolution};
use crate::capture::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensFacing {
    Back,
    Front,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub facing: LensFacing,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?})", self.name, self.id, self.facing)
    }
}

/// The newest completed capture of a wake-up.
#[derive(Debug, Clone)]
pub struct CompletedCapture {
    pub frame: RawFrame,
    /// Hardware timestamps of every capture completed since the previous call,
    /// oldest first. The last entry belongs to `frame`.
    pub timestamps_ns: Vec<i64>,
}

/// Enumerates devices and opens capture sessions.
pub trait CaptureBackend: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceInfo>, CaptureError>;

    /// Sizes the device can deliver in a planar 4:2:0 layout.
    fn supported_sizes(&self, device: &DeviceInfo) -> Result<Vec<Resolution>, CaptureError>;

    fn open(
        &self,
        device: &DeviceInfo,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

/// A configured, streaming session. Dropping it stops streaming.
pub trait CaptureSession: Send {
    /// Size the session actually delivers, which may differ from the one requested.
    fn resolution(&self) -> Resolution;

    /// Wait up to `timeout` for captures to complete.
    ///
    /// Captures that were superseded while the caller was busy are recycled
    /// without being copied; only the newest is returned.
    fn next_capture(&mut self, timeout: Duration) -> Result<Option<CompletedCapture>, CaptureError>;
}

/// An explicit id wins; otherwise the first rear-facing device, else the first device.
pub fn select_device(devices: &[DeviceInfo], preferred: Option<&str>) -> Option<DeviceInfo> {
    if let Some(id) = preferred {
        return devices.iter().find(|d| d.id == id).cloned();
    }
    devices
        .iter()
        .find(|d| d.facing == LensFacing::Back)
        .or_else(|| devices.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, facing: LensFacing) -> DeviceInfo {
        DeviceInfo {
            id: id.into(),
            name: format!("cam {id}"),
            facing,
        }
    }

    #[test]
    fn prefers_rear_facing() {
        let devices = [
            device("0", LensFacing::Front),
            device("1", LensFacing::Back),
            device("2", LensFacing::Back),
        ];
        assert_eq!(select_device(&devices, None).unwrap().id, "1");
    }

    #[test]
    fn falls_back_to_first() {
        let devices = [device("a", LensFacing::External), device("b", LensFacing::Front)];
        assert_eq!(select_device(&devices, None).unwrap().id, "a");
        assert!(select_device(&[], None).is_none());
    }

    #[test]
    fn explicit_id_must_exist() {
        let devices = [device("0", LensFacing::Back), device("1", LensFacing::Front)];
        assert_eq!(select_device(&devices, Some("1")).unwrap().id, "1");
        assert!(select_device(&devices, Some("9")).is_none());
    }
}
