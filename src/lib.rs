pub mod capture;
pub mod convert;
pub mod pipeline;
pub mod render;
pub mod testing;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::frame::{Plane, RawFrame, Resolution};
pub use convert::ProcessedFrame;

/// Prefix for environment overrides, e.g. `IRIS_CAPTURE__BACKEND=synthetic`.
const ENV_PREFIX: &str = "IRIS";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub conversion: ConversionConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
    /// Explicit device id; otherwise rear-facing, else first available.
    pub device: Option<String>,
    pub target_width: u32,
    pub target_height: u32,
    pub buffer_count: u32,
    pub poll_timeout_ms: u64,
    /// Pin the capture worker to this CPU core.
    pub pin_core: Option<usize>,
    pub synthetic: SyntheticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub sizes: Vec<(u32, u32)>,
    pub fps: u32,
    /// Captures completed per wake-up; values above 1 emulate a backlog.
    pub captures_per_wake: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    Bt601,
    Grayscale,
    /// Sobel edge map of the luma plane
    Edges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub converter: ConverterKind,
    /// Gradient magnitude for `edges`; luma is normalized to 0..1.
    pub edge_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackendKind {
    Sdl2,
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: DisplayBackendKind,
    pub width: u32,
    pub height: u32,
    pub tick_hz: u32,
    pub vsync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::V4l2,
            device: None,
            target_width: 1280,
            target_height: 720,
            buffer_count: 3,
            poll_timeout_ms: 200,
            pin_core: None,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn target(&self) -> Resolution {
        Resolution::new(self.target_width, self.target_height)
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sizes: vec![(640, 480), (1280, 720), (1920, 1080)],
            fps: 30,
            captures_per_wake: 1,
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            converter: ConverterKind::Bt601,
            edge_threshold: convert::edges::DEFAULT_EDGE_THRESHOLD,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: DisplayBackendKind::Sdl2,
            width: 1280,
            height: 720,
            tick_hz: 60,
            vsync: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "iris=info".into(),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `IRIS_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sources_yield_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.capture.target(), Resolution::new(1280, 720));
        assert_eq!(config.capture.buffer_count, 3);
        assert_eq!(config.display.tick_hz, 60);
        assert_eq!(config.conversion.converter, ConverterKind::Bt601);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("iris-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[capture]\nbackend = \"synthetic\"\ntarget_width = 640\n\n[conversion]\nconverter = \"grayscale\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.capture.backend, CaptureBackendKind::Synthetic);
        assert_eq!(config.capture.target_width, 640);
        assert_eq!(config.capture.target_height, 720);
        assert_eq!(config.conversion.converter, ConverterKind::Grayscale);
        assert_eq!(config.display.backend, DisplayBackendKind::Sdl2);
    }

    #[test]
    fn edge_converter_is_selectable() {
        let path =
            std::env::temp_dir().join(format!("iris-config-edges-{}.toml", std::process::id()));
        std::fs::write(&path, "[conversion]\nconverter = \"edges\"\nedge_threshold = 0.4\n")
            .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.conversion.converter, ConverterKind::Edges);
        assert!((config.conversion.edge_threshold - 0.4).abs() < 1e-6);
    }
}
