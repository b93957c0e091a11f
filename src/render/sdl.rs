//! SDL2 window renderer
//! Streams each packed RGBA frame into a texture and stretches it over the window.

use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, Texture, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{info, warn};

use crate::capture::frame::Resolution;
use crate::convert::ProcessedFrame;
use crate::render::{FrameRenderer, RenderError};
use crate::DisplayConfig;

/// Byte order R, G, B, A in memory.
#[cfg(target_endian = "little")]
const RGBA_BYTES: PixelFormatEnum = PixelFormatEnum::ABGR8888;
#[cfg(target_endian = "big")]
const RGBA_BYTES: PixelFormatEnum = PixelFormatEnum::RGBA8888;

/// Create the display window with an accelerated canvas.
pub fn create_canvas(sdl: &sdl2::Sdl, config: &DisplayConfig) -> Result<Canvas<Window>, RenderError> {
    let video_subsystem = sdl.video().map_err(RenderError::Surface)?;

    let window = video_subsystem
        .window("Iris", config.width, config.height)
        .position_centered()
        .resizable()
        .build()
        .map_err(|e| RenderError::Surface(e.to_string()))?;

    let mut builder = window.into_canvas().accelerated();
    if config.vsync {
        builder = builder.present_vsync();
    }
    let canvas = builder
        .build()
        .map_err(|e| RenderError::Surface(e.to_string()))?;

    info!("SDL2 canvas ready ({}x{})", config.width, config.height);
    Ok(canvas)
}

pub struct Sdl2Renderer<'a> {
    canvas: Canvas<Window>,
    texture_creator: &'a TextureCreator<WindowContext>,
    texture: Option<(Texture<'a>, Resolution)>,
}

impl<'a> Sdl2Renderer<'a> {
    pub fn new(canvas: Canvas<Window>, texture_creator: &'a TextureCreator<WindowContext>) -> Self {
        Self {
            canvas,
            texture_creator,
            texture: None,
        }
    }

    pub fn set_title(&mut self, title: &str) {
        if let Err(e) = self.canvas.window_mut().set_title(title) {
            warn!("Failed to set window title: {}", e);
        }
    }
}

impl FrameRenderer for Sdl2Renderer<'_> {
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
        let resolution = frame.resolution;

        if self.texture.as_ref().map(|(_, size)| *size) != Some(resolution) {
            let texture = self
                .texture_creator
                .create_texture_streaming(RGBA_BYTES, resolution.width, resolution.height)
                .map_err(|e| RenderError::Upload(e.to_string()))?;
            info!("Streaming texture resized to {}", resolution);
            self.texture = Some((texture, resolution));
        }
        let Some((texture, _)) = self.texture.as_mut() else {
            return Err(RenderError::Upload("texture missing".into()));
        };

        texture
            .update(None, &frame.rgba, resolution.width as usize * 4)
            .map_err(|e| RenderError::Upload(e.to_string()))
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        let Some((texture, _)) = &self.texture else {
            return Err(RenderError::Surface("draw before first upload".into()));
        };

        self.canvas.clear();
        self.canvas
            .copy(texture, None, None)
            .map_err(RenderError::Surface)?;
        self.canvas.present();
        Ok(())
    }
}
