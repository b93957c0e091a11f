//! Iris live camera preview

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use iris::capture::{CaptureBackend, SyntheticCamera};
use iris::convert::{Bt601Converter, Converter, EdgeConverter, GrayscaleConverter};
use iris::pipeline::{PipelineController, PipelineEvent};
use iris::render::{FrameRenderer, PendingFrameSlot, RenderSink};
use iris::{
    CaptureBackendKind, Config, ConversionConfig, ConverterKind, DisplayBackendKind, LoggingConfig,
};

#[derive(Debug, Parser)]
#[command(name = "iris", about = "Live camera preview pipeline")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Iris Launching...");

    let backend = capture_backend(&config)?;
    let slot = Arc::new(PendingFrameSlot::new());
    let mut pipeline = PipelineController::new(
        backend,
        converter(&config.conversion),
        slot.clone(),
        &config.capture,
    )?;

    let result = match config.display.backend {
        DisplayBackendKind::Sdl2 => run_sdl2(&config, &mut pipeline, slot).await,
        DisplayBackendKind::Headless => run_headless(&config, &mut pipeline, slot).await,
    };

    pipeline.shutdown();
    info!(stats = ?pipeline.stats(), "Iris shutting down");
    result
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn capture_backend(config: &Config) -> Result<Arc<dyn CaptureBackend>> {
    match config.capture.backend {
        #[cfg(feature = "v4l2")]
        CaptureBackendKind::V4l2 => Ok(Arc::new(iris::capture::V4l2Backend::new(
            config.capture.buffer_count,
        ))),
        #[cfg(not(feature = "v4l2"))]
        CaptureBackendKind::V4l2 => Err(eyre!("built without the v4l2 feature")),
        CaptureBackendKind::Synthetic => {
            Ok(Arc::new(SyntheticCamera::from_config(&config.capture.synthetic)))
        }
    }
}

fn converter(config: &ConversionConfig) -> Box<dyn Converter> {
    match config.converter {
        ConverterKind::Bt601 => Box::new(Bt601Converter::new()),
        ConverterKind::Grayscale => Box::new(GrayscaleConverter::new()),
        ConverterKind::Edges => Box::new(EdgeConverter::with_threshold(config.edge_threshold)),
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::ResolutionChanged(resolution) => info!(%resolution, "capture resolution"),
        PipelineEvent::Fps(fps) => info!("capture rate: {:.1} fps", fps),
    }
}

/// Display tick loop: drains telemetry, gives the window a chance to react,
/// then draws at most one frame. Ends on Ctrl-C or when `pump` breaks.
async fn display_loop<R, F>(
    pipeline: &mut PipelineController,
    sink: &mut RenderSink<R>,
    tick_hz: u32,
    mut pump: F,
) -> Result<()>
where
    R: FrameRenderer,
    F: FnMut(&mut PipelineController, &mut RenderSink<R>, &[PipelineEvent]) -> ControlFlow<()>,
{
    let events = pipeline.events();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_hz.max(1) as f64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    pipeline.start()?;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received");
                break;
            }
        }

        let batch: Vec<PipelineEvent> = events.try_iter().collect();
        batch.iter().for_each(log_event);

        if pump(pipeline, sink, &batch).is_break() {
            break;
        }
        sink.tick();
    }

    info!(
        drawn = sink.stats().drawn(),
        idle = sink.stats().idle_ticks(),
        failed = sink.stats().failed(),
        "display loop finished"
    );
    Ok(())
}

#[cfg(feature = "sdl2-display")]
async fn run_sdl2(
    config: &Config,
    pipeline: &mut PipelineController,
    slot: Arc<PendingFrameSlot>,
) -> Result<()> {
    use iris::render::sdl::create_canvas;
    use iris::render::Sdl2Renderer;
    use sdl2::event::{Event, WindowEvent};
    use sdl2::keyboard::Keycode;

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let canvas = create_canvas(&sdl_context, &config.display)?;
    let texture_creator = canvas.texture_creator();
    let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

    let mut sink = RenderSink::with_slot(Sdl2Renderer::new(canvas, &texture_creator), slot);
    let mut title = Title::default();

    display_loop(pipeline, &mut sink, config.display.tick_hz, |pipeline, sink, events| {
        for event in event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                } => return ControlFlow::Break(()),
                Event::Window {
                    win_event: WindowEvent::Minimized,
                    ..
                } => pipeline.pause(),
                Event::Window {
                    win_event: WindowEvent::Restored,
                    ..
                } => {
                    if let Err(e) = pipeline.resume() {
                        warn!(error = %e, "failed to resume capture");
                    }
                }
                _ => {}
            }
        }

        if title.update(events) {
            sink.renderer_mut().set_title(&title.to_string());
        }
        ControlFlow::Continue(())
    })
    .await
}

#[cfg(not(feature = "sdl2-display"))]
async fn run_sdl2(_: &Config, _: &mut PipelineController, _: Arc<PendingFrameSlot>) -> Result<()> {
    Err(eyre!("built without the sdl2-display feature"))
}

#[cfg(feature = "gpu-display")]
async fn run_headless(
    config: &Config,
    pipeline: &mut PipelineController,
    slot: Arc<PendingFrameSlot>,
) -> Result<()> {
    use iris::render::GpuRenderer;
    use iris::Resolution;

    let viewport = Resolution::new(config.display.width, config.display.height);
    let renderer = GpuRenderer::new_headless(viewport).await?;
    let mut sink = RenderSink::with_slot(renderer, slot);

    display_loop(pipeline, &mut sink, config.display.tick_hz, |_, _, _| {
        ControlFlow::Continue(())
    })
    .await
}

#[cfg(not(feature = "gpu-display"))]
async fn run_headless(
    _: &Config,
    _: &mut PipelineController,
    _: Arc<PendingFrameSlot>,
) -> Result<()> {
    Err(eyre!("built without the gpu-display feature"))
}

/// Window title carrying the latest resolution and frame rate.
#[cfg(feature = "sdl2-display")]
#[derive(Debug, Default)]
struct Title {
    resolution: Option<iris::Resolution>,
    fps: Option<f64>,
}

#[cfg(feature = "sdl2-display")]
impl Title {
    fn update(&mut self, events: &[PipelineEvent]) -> bool {
        for event in events {
            match *event {
                PipelineEvent::ResolutionChanged(resolution) => self.resolution = Some(resolution),
                PipelineEvent::Fps(fps) => self.fps = Some(fps),
            }
        }
        !events.is_empty()
    }
}

#[cfg(feature = "sdl2-display")]
impl std::fmt::Display for Title {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Iris")?;
        if let Some(resolution) = self.resolution {
            write!(f, " - {}", resolution)?;
        }
        if let Some(fps) = self.fps {
            write!(f, " @ {:.1} fps", fps)?;
        }
        Ok(())
    }
}
