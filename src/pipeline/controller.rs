use std::sync::Arc;

use flume::Receiver;
use tracing::{info, instrument};

use crate::capture::device::CaptureBackend;
use crate::capture::frame::Resolution;
use crate::capture::source::{FrameSource, SourceConfig};
use crate::convert::stage::ConversionStage;
use crate::convert::Converter;
use crate::pipeline::{PipelineError, PipelineEvent};
use crate::render::slot::PendingFrameSlot;
use crate::CaptureConfig;

const EVENT_CAPACITY: usize = 64;

/// Counter snapshot across the capture and conversion stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub sessions_started: u64,
    pub captures_completed: u64,
    pub frames_delivered: u64,
    pub frames_superseded: u64,
    pub frames_received: u64,
    pub frames_converted: u64,
    pub conversions_failed: u64,
    pub frames_dropped: u64,
}

/// Wires FrameSource → ConversionStage → PendingFrameSlot and drives their lifecycle.
///
/// The render side stays with the caller: it owns the display thread and
/// takes frames from the same slot passed in here.
pub struct PipelineController {
    source: FrameSource,
    stage: ConversionStage,
    output: Arc<PendingFrameSlot>,
    events: Receiver<PipelineEvent>,
    shut_down: bool,
}

impl PipelineController {
    #[instrument(skip_all)]
    pub fn new<C>(
        backend: Arc<dyn CaptureBackend>,
        converter: C,
        output: Arc<PendingFrameSlot>,
        config: &CaptureConfig,
    ) -> Result<Self, PipelineError>
    where
        C: Converter + 'static,
    {
        let stage = ConversionStage::spawn(converter, output.clone())?;
        // Telemetry is lossy; a slow reader never stalls capture
        let (tx, events) = flume::bounded(EVENT_CAPACITY);
        let source = FrameSource::new(
            backend,
            Arc::new(stage.handle()),
            tx,
            SourceConfig::from(config),
        );

        Ok(Self {
            source,
            stage,
            output,
            events,
            shut_down: false,
        })
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.source.start()?;
        Ok(())
    }

    /// Synchronous: no frame enters conversion after this returns.
    pub fn pause(&mut self) {
        self.source.pause();
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        self.source.resume()?;
        Ok(())
    }

    /// Release capture, then close conversion once in-flight work is done.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.shut_down, true) {
            return;
        }
        self.source.release();
        self.stage.close();
        info!("pipeline shut down");
    }

    pub fn is_running(&self) -> bool {
        self.source.is_running()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.source.resolution()
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.clone()
    }

    /// Slot the render side takes converted frames from.
    pub fn output(&self) -> Arc<PendingFrameSlot> {
        self.output.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let source = self.source.stats();
        let conversion = self.stage.stats();
        PipelineStats {
            sessions_started: source.sessions_started(),
            captures_completed: source.captures_completed(),
            frames_delivered: source.frames_delivered(),
            frames_superseded: source.frames_superseded(),
            frames_received: conversion.received(),
            frames_converted: conversion.converted(),
            conversions_failed: conversion.failed(),
            frames_dropped: conversion.dropped_uninitialized()
                + conversion.replaced_pending()
                + conversion.dropped_mismatched(),
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::capture::synthetic::SyntheticCamera;
    use crate::capture::CaptureError;
    use crate::testing::{init_test_tracing, LumaFillConverter};
    use crate::CaptureBackendKind;

    fn config() -> CaptureConfig {
        CaptureConfig {
            backend: CaptureBackendKind::Synthetic,
            target_width: 64,
            target_height: 48,
            poll_timeout_ms: 20,
            ..CaptureConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn frames_flow_into_the_output_slot() {
        init_test_tracing();
        let camera = SyntheticCamera::new([Resolution::new(32, 24), Resolution::new(64, 48)])
            .with_fps(200);
        let slot = Arc::new(PendingFrameSlot::new());
        let mut pipeline = PipelineController::new(
            Arc::new(camera),
            LumaFillConverter::default(),
            slot.clone(),
            &config(),
        )
        .unwrap();

        pipeline.start().unwrap();
        assert_eq!(pipeline.resolution(), Some(Resolution::new(64, 48)));
        wait_for(|| !slot.is_empty());
        let frame = slot.take().unwrap();
        pipeline.shutdown();

        assert_eq!(frame.resolution, Resolution::new(64, 48));
        assert_eq!(frame.rgba.len(), 64 * 48 * 4);
        let stats = pipeline.stats();
        assert!(stats.frames_converted >= 1);
        assert!(stats.frames_converted <= stats.frames_delivered);
        assert_eq!(
            pipeline.events().try_recv().unwrap(),
            PipelineEvent::ResolutionChanged(Resolution::new(64, 48))
        );
    }

    #[test]
    fn lifecycle_calls_are_idempotent() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]).with_fps(100);
        let mut pipeline = PipelineController::new(
            Arc::new(camera.clone()),
            LumaFillConverter::default(),
            Arc::new(PendingFrameSlot::new()),
            &config(),
        )
        .unwrap();

        pipeline.start().unwrap();
        pipeline.start().unwrap();
        pipeline.pause();
        pipeline.pause();
        assert!(!pipeline.is_running());
        assert_eq!(camera.sessions_opened(), 1);

        pipeline.resume().unwrap();
        assert!(pipeline.is_running());
        assert_eq!(pipeline.stats().sessions_started, 2);

        pipeline.shutdown();
        pipeline.shutdown();
        assert_eq!(camera.active_sessions(), 0);
        assert!(matches!(
            pipeline.resume(),
            Err(PipelineError::Capture(CaptureError::Released))
        ));
    }

    #[test]
    fn nothing_converts_after_pause() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]).with_fps(500);
        let slot = Arc::new(PendingFrameSlot::new());
        let mut pipeline = PipelineController::new(
            Arc::new(camera),
            LumaFillConverter::default(),
            slot.clone(),
            &config(),
        )
        .unwrap();

        pipeline.start().unwrap();
        wait_for(|| pipeline.stats().frames_converted > 0);
        pipeline.pause();

        // Let any frame already queued before the pause drain out
        wait_for(|| {
            let stats = pipeline.stats();
            stats.frames_converted + stats.frames_dropped + stats.conversions_failed
                == stats.frames_received
        });
        let settled = pipeline.stats();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pipeline.stats(), settled);
    }
}
