#[cfg(feature = "gpu-display")]
pub mod gpu;
#[cfg(feature = "sdl2-display")]
pub mod sdl;
pub mod sink;
pub mod slot;

use thiserror::Error;

use crate::convert::ProcessedFrame;

#[cfg(feature = "gpu-display")]
pub use gpu::GpuRenderer;
#[cfg(feature = "sdl2-display")]
pub use sdl::Sdl2Renderer;
pub use sink::{RenderSink, RenderStats, Tick};
pub use slot::PendingFrameSlot;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no suitable GPU adapter found")]
    Adapter,
    #[error("failed to create GPU device: {0}")]
    Device(String),
    /// Shader compile or pipeline link failure; there is no render path without it.
    #[error("shader pipeline failed to build: {0}")]
    Shader(String),
    #[error("display surface error: {0}")]
    Surface(String),
    #[error("texture upload failed: {0}")]
    Upload(String),
}

/// Display boundary: a GPU context that can take a packed RGBA buffer and draw it.
///
/// Setup (shaders, texture handle, quad geometry) happens in the constructor
/// and is fatal on failure. Per-frame calls may fail without ending the render path.
pub trait FrameRenderer {
    /// Replace the texture contents with `frame`.
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError>;

    /// Draw the full-viewport textured quad.
    fn draw(&mut self) -> Result<(), RenderError>;
}

impl<R: FrameRenderer + ?Sized> FrameRenderer for Box<R> {
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
        (**self).upload(frame)
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        (**self).draw()
    }
}
