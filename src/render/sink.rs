use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use tracing::{trace, warn};

use crate::convert::ProcessedFrame;
use crate::render::slot::PendingFrameSlot;
use crate::render::FrameRenderer;

/// Outcome of one display tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing pending; the previous image stays on screen.
    Idle,
    Drew { sequence: u64 },
    /// The frame was consumed but could not be shown.
    Failed { sequence: u64 },
}

#[derive(Debug, Default)]
pub struct RenderStats {
    ticks: AtomicU64,
    idle_ticks: AtomicU64,
    drawn: AtomicU64,
    failed: AtomicU64,
}

impl RenderStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    pub fn drawn(&self) -> u64 {
        self.drawn.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Draws the most recently completed frame once per display tick.
pub struct RenderSink<R> {
    slot: Arc<PendingFrameSlot>,
    renderer: R,
    stats: CachePadded<RenderStats>,
}

impl<R: FrameRenderer> RenderSink<R> {
    pub fn new(renderer: R) -> Self {
        Self::with_slot(renderer, Arc::new(PendingFrameSlot::new()))
    }

    pub fn with_slot(renderer: R, slot: Arc<PendingFrameSlot>) -> Self {
        Self {
            slot,
            renderer,
            stats: CachePadded::new(RenderStats::default()),
        }
    }

    /// Write side of the hand-off, for wiring into the conversion stage.
    pub fn slot(&self) -> Arc<PendingFrameSlot> {
        self.slot.clone()
    }

    /// Overwrite the pending frame; an undrawn predecessor is discarded.
    pub fn submit_frame(&self, frame: ProcessedFrame) {
        self.slot.submit(frame);
    }

    /// One display tick. Never blocks on the conversion side.
    pub fn tick(&mut self) -> Tick {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let Some(frame) = self.slot.take() else {
            self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
            return Tick::Idle;
        };

        let render_start = Instant::now();
        let sequence = frame.sequence;
        let result = self
            .renderer
            .upload(&frame)
            .and_then(|()| self.renderer.draw());

        match result {
            Ok(()) => {
                metrics::histogram!("iris_render_time_us")
                    .record(render_start.elapsed().as_micros() as f64);
                metrics::counter!("iris_frames_drawn").increment(1);
                self.stats.drawn.fetch_add(1, Ordering::Relaxed);
                trace!(sequence, "frame drawn");
                Tick::Drew { sequence }
            }
            Err(e) => {
                warn!(sequence, error = %e, "failed to draw frame");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Tick::Failed { sequence }
            }
        }
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }
}
