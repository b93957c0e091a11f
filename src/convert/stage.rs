//! Serialized conversion worker with a depth-1 pending frame register.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::frame::{RawFrame, Resolution};
use crate::capture::source::FrameConsumer;
use crate::convert::{ConvertError, Converter, ProcessedFrame};
use crate::render::slot::PendingFrameSlot;

/// Work items, executed strictly in submission order.
///
/// `Frame` is a doorbell: the frame itself sits in the pending register, so a
/// newer frame can replace it without growing the queue.
#[derive(Debug)]
enum Task {
    Init(Resolution),
    Frame,
    Release,
    Shutdown,
}

#[derive(Debug, Default)]
pub struct ConversionStats {
    received: AtomicU64,
    dropped_uninitialized: AtomicU64,
    replaced_pending: AtomicU64,
    dropped_mismatched: AtomicU64,
    converted: AtomicU64,
    failed: AtomicU64,
}

impl ConversionStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames that arrived before init finished, or after close.
    pub fn dropped_uninitialized(&self) -> u64 {
        self.dropped_uninitialized.load(Ordering::Relaxed)
    }

    /// Pending frames replaced by a newer one before the worker reached them.
    pub fn replaced_pending(&self) -> u64 {
        self.replaced_pending.load(Ordering::Relaxed)
    }

    pub fn dropped_mismatched(&self) -> u64 {
        self.dropped_mismatched.load(Ordering::Relaxed)
    }

    pub fn converted(&self) -> u64 {
        self.converted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

struct Shared {
    pending: ArcSwapOption<RawFrame>,
    initialized: AtomicBool,
    accepting: AtomicBool,
    stats: CachePadded<ConversionStats>,
}

/// Cloneable submission side of a [`ConversionStage`].
#[derive(Clone)]
pub struct ConversionHandle {
    tx: Sender<Task>,
    shared: Arc<Shared>,
}

impl ConversionHandle {
    /// Queue a (re)initialization of the converter for `resolution`.
    pub fn on_resolution_changed(&self, resolution: Resolution) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            debug!(%resolution, "conversion stage closed, ignoring resolution change");
            return;
        }
        self.tx.send(Task::Init(resolution)).ok();
    }

    /// Fire-and-forget. Frames arriving before init completes are dropped.
    pub fn process(&self, frame: RawFrame) {
        let stats = &self.shared.stats;
        stats.received.fetch_add(1, Ordering::Relaxed);

        if !self.shared.accepting.load(Ordering::Acquire)
            || !self.shared.initialized.load(Ordering::Acquire)
        {
            trace!(sequence = frame.sequence, "converter not ready, dropping frame");
            stats.dropped_uninitialized.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.shared.pending.swap(Some(Arc::new(frame))).is_some() {
            stats.replaced_pending.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("iris_frames_superseded", "stage" => "conversion").increment(1);
        } else {
            // Register was empty, so no doorbell is outstanding for it
            self.tx.send(Task::Frame).ok();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ConversionStats {
        &self.shared.stats
    }
}

impl FrameConsumer for ConversionHandle {
    fn resolution_changed(&self, resolution: Resolution) {
        self.on_resolution_changed(resolution);
    }

    fn submit(&self, frame: RawFrame) {
        self.process(frame);
    }
}

/// Owns the single worker thread that runs every converter call.
pub struct ConversionStage {
    handle: ConversionHandle,
    worker: Option<JoinHandle<()>>,
}

impl ConversionStage {
    #[instrument(skip_all)]
    pub fn spawn<C>(converter: C, output: Arc<PendingFrameSlot>) -> Result<Self, ConvertError>
    where
        C: Converter + 'static,
    {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            pending: ArcSwapOption::empty(),
            initialized: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            stats: CachePadded::new(ConversionStats::default()),
        });

        let worker = Worker {
            converter,
            rx,
            shared: shared.clone(),
            output,
            resolution: None,
        };
        let join = std::thread::Builder::new()
            .name("iris-convert".into())
            .spawn(move || worker.run())
            .map_err(|e| ConvertError::Worker(e.to_string()))?;

        info!("conversion worker started");
        Ok(Self {
            handle: ConversionHandle { tx, shared },
            worker: Some(join),
        })
    }

    pub fn handle(&self) -> ConversionHandle {
        self.handle.clone()
    }

    pub fn on_resolution_changed(&self, resolution: Resolution) {
        self.handle.on_resolution_changed(resolution);
    }

    pub fn process(&self, frame: RawFrame) {
        self.handle.process(frame);
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_initialized()
    }

    pub fn stats(&self) -> &ConversionStats {
        self.handle.stats()
    }

    /// Stop accepting frames, release the converter after in-flight work, and join.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.handle.shared.accepting.store(false, Ordering::Release);
        self.handle.tx.send(Task::Release).ok();
        self.handle.tx.send(Task::Shutdown).ok();

        if worker.join().is_err() {
            error!("conversion worker panicked");
        }
        info!("conversion stage closed");
    }
}

impl Drop for ConversionStage {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker<C> {
    converter: C,
    rx: Receiver<Task>,
    shared: Arc<Shared>,
    output: Arc<PendingFrameSlot>,
    resolution: Option<Resolution>,
}

impl<C: Converter> Worker<C> {
    fn run(mut self) {
        while let Ok(task) = self.rx.recv() {
            match task {
                Task::Init(resolution) => self.init(resolution),
                Task::Frame => self.convert_pending(),
                Task::Release => self.release(),
                Task::Shutdown => break,
            }
        }

        if self.resolution.is_some() {
            self.release();
        }
        debug!("conversion worker exiting");
    }

    fn init(&mut self, resolution: Resolution) {
        match self.converter.init(resolution) {
            Ok(()) => {
                self.resolution = Some(resolution);
                self.shared.initialized.store(true, Ordering::Release);
                info!(%resolution, "converter initialized");
            }
            Err(e) => {
                self.resolution = None;
                self.shared.initialized.store(false, Ordering::Release);
                error!(%resolution, error = %e, "converter init failed, frames will be dropped");
            }
        }
    }

    fn release(&mut self) {
        self.shared.initialized.store(false, Ordering::Release);
        self.converter.release();
        self.resolution = None;
        debug!("converter released");
    }

    fn convert_pending(&mut self) {
        let Some(frame) = self.shared.pending.swap(None) else {
            return;
        };
        let stats = &self.shared.stats;

        let Some(expected) = self.resolution else {
            stats.dropped_uninitialized.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if frame.resolution != expected {
            debug!(frame = %frame.resolution, %expected, "frame from previous resolution, dropping");
            stats.dropped_mismatched.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let start = Instant::now();
        let result = self.converter.convert(&frame);
        let conversion_time = start.elapsed();

        let rgba = match result {
            Ok(rgba) if rgba.len() == expected.rgba_len() => rgba,
            Ok(rgba) => {
                let e = ConvertError::OutputSize {
                    expected: expected.rgba_len(),
                    actual: rgba.len(),
                };
                warn!(sequence = frame.sequence, error = %e, "discarding converted frame");
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "conversion failed");
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.output.submit(ProcessedFrame {
            resolution: frame.resolution,
            rgba: Bytes::from(rgba),
            conversion_time,
            sequence: frame.sequence,
        });

        // Counted after the hand-off so a settled count implies a filled slot
        metrics::histogram!("iris_conversion_time_us").record(conversion_time.as_micros() as f64);
        metrics::counter!("iris_frames_converted").increment(1);
        stats.converted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::convert::GrayscaleConverter;
    use crate::testing::synthetic_frame;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Blocks inside `convert` until the test opens the gate.
    struct GatedConverter {
        entered: Sender<u64>,
        gate: Receiver<()>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Converter for GatedConverter {
        fn init(&mut self, resolution: Resolution) -> Result<(), ConvertError> {
            self.log.lock().unwrap().push(format!("init {resolution}"));
            Ok(())
        }

        fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("convert {}", frame.sequence));
            self.entered.send(frame.sequence).unwrap();
            self.gate.recv().unwrap();
            Ok(vec![0; frame.resolution.rgba_len()])
        }

        fn release(&mut self) {
            self.log.lock().unwrap().push("release".into());
        }
    }

    struct Gated {
        stage: ConversionStage,
        slot: Arc<PendingFrameSlot>,
        entered: Receiver<u64>,
        gate: Sender<()>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn gated() -> Gated {
        let (entered_tx, entered) = flume::unbounded();
        let (gate, gate_rx) = flume::unbounded();
        let log = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(PendingFrameSlot::new());
        let stage = ConversionStage::spawn(
            GatedConverter {
                entered: entered_tx,
                gate: gate_rx,
                log: log.clone(),
            },
            slot.clone(),
        )
        .unwrap();
        Gated {
            stage,
            slot,
            entered,
            gate,
            log,
        }
    }

    #[test]
    fn frames_before_init_are_dropped() {
        let slot = Arc::new(PendingFrameSlot::new());
        let stage = ConversionStage::spawn(GrayscaleConverter::new(), slot.clone()).unwrap();

        stage.process(synthetic_frame(Resolution::new(4, 4), 0));

        assert_eq!(stage.stats().dropped_uninitialized(), 1);
        assert!(slot.is_empty());
    }

    #[test]
    fn converts_with_matching_dimensions_and_timing() {
        let slot = Arc::new(PendingFrameSlot::new());
        let stage = ConversionStage::spawn(GrayscaleConverter::new(), slot.clone()).unwrap();
        let res = Resolution::new(6, 4);

        stage.on_resolution_changed(res);
        wait_for(|| stage.is_initialized());
        stage.process(synthetic_frame(res, 7));
        wait_for(|| !slot.is_empty());

        let frame = slot.take().unwrap();
        assert_eq!(frame.resolution, res);
        assert_eq!(frame.rgba.len(), 6 * 4 * 4);
        assert_eq!(frame.sequence, 7);
        assert_eq!(stage.stats().converted(), 1);
    }

    #[test]
    fn backlog_keeps_only_the_newest_pending_frame() {
        let g = gated();
        let res = Resolution::new(2, 2);
        g.stage.on_resolution_changed(res);
        wait_for(|| g.stage.is_initialized());

        g.stage.process(synthetic_frame(res, 0));
        assert_eq!(g.entered.recv().unwrap(), 0);

        // Worker is busy with frame 0
        for seq in 1..=3 {
            g.stage.process(synthetic_frame(res, seq));
        }
        assert_eq!(g.stage.stats().replaced_pending(), 2);

        g.gate.send(()).unwrap();
        assert_eq!(g.entered.recv().unwrap(), 3);
        g.gate.send(()).unwrap();
        wait_for(|| g.stage.stats().converted() == 2);

        assert_eq!(g.slot.take().unwrap().sequence, 3);
        assert_eq!(g.slot.replaced(), 1);
    }

    #[test]
    fn close_releases_after_in_flight_conversion() {
        let mut g = gated();
        let res = Resolution::new(2, 2);
        g.stage.on_resolution_changed(res);
        wait_for(|| g.stage.is_initialized());

        g.stage.process(synthetic_frame(res, 0));
        assert_eq!(g.entered.recv().unwrap(), 0);

        let gate = g.gate.clone();
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            gate.send(()).unwrap();
        });
        g.stage.close();
        opener.join().unwrap();

        assert_eq!(
            *g.log.lock().unwrap(),
            vec!["init 2x2".to_string(), "convert 0".into(), "release".into()]
        );
        assert!(!g.stage.is_initialized());

        g.stage.process(synthetic_frame(res, 1));
        assert_eq!(g.stage.stats().dropped_uninitialized(), 1);
        g.stage.close();
    }

    #[test]
    fn frames_from_a_stale_resolution_are_dropped() {
        let g = gated();
        let old = Resolution::new(2, 2);
        let new = Resolution::new(4, 2);
        g.stage.on_resolution_changed(old);
        wait_for(|| g.stage.is_initialized());

        g.stage.process(synthetic_frame(old, 0));
        assert_eq!(g.entered.recv().unwrap(), 0);
        // Doorbell for the pending register is queued ahead of the re-init
        g.stage.process(synthetic_frame(old, 1));
        g.stage.on_resolution_changed(new);
        g.stage.process(synthetic_frame(new, 2));

        g.gate.send(()).unwrap();
        wait_for(|| g.log.lock().unwrap().contains(&"init 4x2".to_string()));
        assert_eq!(g.stage.stats().dropped_mismatched(), 1);
        assert_eq!(g.stage.stats().converted(), 1);
    }

    struct Faulty;

    impl Converter for Faulty {
        fn init(&mut self, _resolution: Resolution) -> Result<(), ConvertError> {
            Ok(())
        }

        fn convert(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ConvertError> {
            match frame.sequence {
                0 => Err(ConvertError::NotInitialized),
                1 => Ok(vec![0; 3]),
                _ => Ok(vec![0; frame.resolution.rgba_len()]),
            }
        }

        fn release(&mut self) {}
    }

    #[test]
    fn per_frame_failures_produce_nothing() {
        let slot = Arc::new(PendingFrameSlot::new());
        let stage = ConversionStage::spawn(Faulty, slot.clone()).unwrap();
        let res = Resolution::new(2, 2);
        stage.on_resolution_changed(res);
        wait_for(|| stage.is_initialized());

        for seq in 0..3 {
            stage.process(synthetic_frame(res, seq));
            wait_for(|| stage.stats().failed() + stage.stats().converted() == seq + 1);
        }

        assert_eq!(stage.stats().failed(), 2);
        assert_eq!(slot.take().unwrap().sequence, 2);
        assert_eq!(slot.submitted(), 1);
    }
}
