//! Capture worker lifecycle and raw frame emission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::Sender;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{select_device, CaptureBackend, CaptureSession};
use crate::capture::fps::FrameRateEstimator;
use crate::capture::frame::{RawFrame, Resolution};
use crate::capture::resolution::select_resolution;
use crate::capture::CaptureError;
use crate::pipeline::PipelineEvent;
use crate::CaptureConfig;

/// Downstream entry point for raw frames; called from the capture worker.
pub trait FrameConsumer: Send + Sync {
    /// Called once per session start, before the first `submit`.
    fn resolution_changed(&self, resolution: Resolution);

    /// Must return promptly; the capture worker does not queue.
    fn submit(&self, frame: RawFrame);
}

#[derive(Debug, Default)]
pub struct SourceStats {
    sessions_started: AtomicU64,
    captures_completed: AtomicU64,
    frames_delivered: AtomicU64,
    frames_superseded: AtomicU64,
}

impl SourceStats {
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    /// Every capture the device completed, delivered or not.
    pub fn captures_completed(&self) -> u64 {
        self.captures_completed.load(Ordering::Relaxed)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    /// Captures recycled at the device layer because a newer one was ready.
    pub fn frames_superseded(&self) -> u64 {
        self.frames_superseded.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub device: Option<String>,
    pub target: Resolution,
    pub poll_timeout: Duration,
    pub pin_core: Option<usize>,
}

impl From<&CaptureConfig> for SourceConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            device: config.device.clone(),
            target: config.target(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.max(1)),
            pin_core: config.pin_core,
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    resolution: Resolution,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn join(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            error!("capture worker panicked");
        }
    }
}

enum State {
    Stopped,
    Running(Worker),
    Released,
}

/// Owns the capture device and the background worker that drains it.
pub struct FrameSource {
    backend: Arc<dyn CaptureBackend>,
    consumer: Arc<dyn FrameConsumer>,
    events: Sender<PipelineEvent>,
    config: SourceConfig,
    state: State,
    stats: Arc<CachePadded<SourceStats>>,
}

impl FrameSource {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        consumer: Arc<dyn FrameConsumer>,
        events: Sender<PipelineEvent>,
        config: SourceConfig,
    ) -> Self {
        Self {
            backend,
            consumer,
            events,
            config,
            state: State::Stopped,
            stats: Arc::new(CachePadded::new(SourceStats::default())),
        }
    }

    /// Open a session and start the capture worker. A no-op while running.
    ///
    /// A configuration failure leaves the source stopped; nothing retries
    /// until the next explicit `start`.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Released => {
                self.state = State::Released;
                return Err(CaptureError::Released);
            }
            State::Running(worker) if worker.is_alive() => {
                debug!("capture already running");
                self.state = State::Running(worker);
                return Ok(());
            }
            State::Running(worker) => {
                debug!("reaping capture worker that stopped on its own");
                worker.join();
            }
            State::Stopped => {}
        }

        let devices = self.backend.devices()?;
        let device = select_device(&devices, self.config.device.as_deref())
            .ok_or_else(|| CaptureError::NoDevice(self.config.device.clone()))?;
        let sizes = self.backend.supported_sizes(&device)?;
        let requested = select_resolution(&sizes, self.config.target);
        let session = self.backend.open(&device, requested)?;
        // The driver may have adjusted the size; downstream follows the session
        let resolution = session.resolution();
        if resolution != requested {
            warn!(%requested, %resolution, "session negotiated a different size");
        }

        info!(%device, %resolution, "capture session configured");

        // Downstream must be ready for this size before the first frame
        self.consumer.resolution_changed(resolution);
        self.events
            .try_send(PipelineEvent::ResolutionChanged(resolution))
            .ok();

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = CaptureLoop {
            session,
            stop: stop.clone(),
            consumer: self.consumer.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            poll_timeout: self.config.poll_timeout,
            pin_core: self.config.pin_core,
        };
        let handle = std::thread::Builder::new()
            .name("iris-capture".into())
            .spawn(move || ctx.run())
            .map_err(CaptureError::Worker)?;

        self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.state = State::Running(Worker {
            stop,
            handle,
            resolution,
        });
        Ok(())
    }

    /// Stop capture and join the worker. Returns only once no capture can fire.
    pub fn pause(&mut self) {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(worker) => {
                worker.join();
                info!("capture paused");
            }
            other => self.state = other,
        }
    }

    pub fn resume(&mut self) -> Result<(), CaptureError> {
        if self.is_running() {
            return Ok(());
        }
        self.start()
    }

    /// Full teardown. The source cannot be started again.
    pub fn release(&mut self) {
        self.pause();
        if !matches!(self.state, State::Released) {
            self.state = State::Released;
            info!("frame source released");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&self.state, State::Running(worker) if worker.is_alive())
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, State::Released)
    }

    /// Resolution of the active session, if any.
    pub fn resolution(&self) -> Option<Resolution> {
        match &self.state {
            State::Running(worker) => Some(worker.resolution),
            _ => None,
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.pause();
    }
}

struct CaptureLoop {
    session: Box<dyn CaptureSession>,
    stop: Arc<AtomicBool>,
    consumer: Arc<dyn FrameConsumer>,
    events: Sender<PipelineEvent>,
    stats: Arc<CachePadded<SourceStats>>,
    poll_timeout: Duration,
    pin_core: Option<usize>,
}

impl CaptureLoop {
    fn run(mut self) {
        if let Some(id) = self.pin_core {
            if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                warn!(core = id, "failed to pin capture worker");
            }
        }

        // Timestamps from a previous session share no origin with this one
        let mut fps = FrameRateEstimator::new();

        while !self.stop.load(Ordering::Acquire) {
            let capture = match self.session.next_capture(self.poll_timeout) {
                Ok(Some(capture)) => capture,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "capture session failed, stopped until restarted");
                    break;
                }
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let completed = capture.timestamps_ns.len() as u64;
            self.stats
                .captures_completed
                .fetch_add(completed, Ordering::Relaxed);
            metrics::counter!("iris_frames_captured").increment(completed);

            let superseded = completed.saturating_sub(1);
            if superseded > 0 {
                self.stats
                    .frames_superseded
                    .fetch_add(superseded, Ordering::Relaxed);
                metrics::counter!("iris_frames_superseded", "stage" => "capture")
                    .increment(superseded);
            }

            for timestamp in &capture.timestamps_ns {
                if let Some(rate) = fps.record(*timestamp) {
                    debug!(fps = rate, "capture rate");
                    metrics::gauge!("iris_capture_fps").set(rate);
                    self.events.try_send(PipelineEvent::Fps(rate)).ok();
                }
            }

            self.consumer.submit(capture.frame);
            self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        }

        debug!("capture worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::capture::synthetic::SyntheticCamera;

    #[derive(Default)]
    struct Recorder {
        resolutions: Mutex<Vec<Resolution>>,
        frames: Mutex<Vec<(u64, Resolution)>>,
    }

    impl FrameConsumer for Recorder {
        fn resolution_changed(&self, resolution: Resolution) {
            self.resolutions.lock().unwrap().push(resolution);
        }

        fn submit(&self, frame: RawFrame) {
            // Resolution must always be published first
            assert!(!self.resolutions.lock().unwrap().is_empty());
            self.frames
                .lock()
                .unwrap()
                .push((frame.sequence, frame.resolution));
        }
    }

    fn config() -> SourceConfig {
        SourceConfig {
            device: None,
            target: Resolution::new(1280, 720),
            poll_timeout: Duration::from_millis(20),
            pin_core: None,
        }
    }

    fn source(
        camera: &SyntheticCamera,
    ) -> (FrameSource, Arc<Recorder>, flume::Receiver<PipelineEvent>) {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = flume::unbounded();
        let source = FrameSource::new(Arc::new(camera.clone()), recorder.clone(), tx, config());
        (source, recorder, rx)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn publishes_closest_resolution_before_frames() {
        let camera = SyntheticCamera::new([
            Resolution::new(640, 480),
            Resolution::new(1296, 730),
            Resolution::new(1280, 720),
        ])
        .with_fps(200);
        let (mut source, recorder, events) = source(&camera);

        source.start().unwrap();
        wait_for(|| recorder.frames.lock().unwrap().len() >= 3);
        source.pause();

        assert_eq!(
            *recorder.resolutions.lock().unwrap(),
            vec![Resolution::new(1280, 720)]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PipelineEvent::ResolutionChanged(Resolution::new(1280, 720))
        );
        let frames = recorder.frames.lock().unwrap();
        assert!(frames.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(frames.iter().all(|(_, r)| *r == Resolution::new(1280, 720)));
    }

    #[test]
    fn start_twice_and_pause_twice_keep_one_session() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]).with_fps(100);
        let (mut source, _recorder, _events) = source(&camera);

        source.start().unwrap();
        source.start().unwrap();
        assert_eq!(camera.sessions_opened(), 1);
        assert_eq!(camera.active_sessions(), 1);

        source.pause();
        source.pause();
        assert!(!source.is_running());
        assert_eq!(camera.active_sessions(), 0);

        source.resume().unwrap();
        assert_eq!(camera.sessions_opened(), 2);
        assert_eq!(source.stats().sessions_started(), 2);
    }

    #[test]
    fn pause_is_synchronous() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]).with_fps(500);
        let (mut source, recorder, _events) = source(&camera);

        source.start().unwrap();
        wait_for(|| !recorder.frames.lock().unwrap().is_empty());
        source.pause();

        let delivered = recorder.frames.lock().unwrap().len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.frames.lock().unwrap().len(), delivered);
        assert_eq!(source.stats().frames_delivered(), delivered as u64);
    }

    #[test]
    fn release_is_irreversible() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]);
        let (mut source, _recorder, _events) = source(&camera);

        source.start().unwrap();
        source.release();
        assert!(source.is_released());
        assert_eq!(camera.active_sessions(), 0);
        assert!(matches!(source.start(), Err(CaptureError::Released)));
        assert!(matches!(source.resume(), Err(CaptureError::Released)));
        source.release();
    }

    #[test]
    fn configuration_failure_waits_for_explicit_restart() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]);
        let (mut source, recorder, _events) = source(&camera);
        camera.fail_opens(1);

        assert!(matches!(source.start(), Err(CaptureError::Session(_))));
        assert!(!source.is_running());
        assert!(recorder.resolutions.lock().unwrap().is_empty());

        source.start().unwrap();
        assert!(source.is_running());
    }

    #[test]
    fn missing_device_is_reported() {
        let camera = SyntheticCamera::new([Resolution::new(16, 16)]).with_devices(Vec::new());
        let (mut source, _recorder, _events) = source(&camera);
        assert!(matches!(source.start(), Err(CaptureError::NoDevice(None))));
    }

    #[test]
    fn backlog_delivers_latest_but_counts_every_timestamp() {
        // 100 fps sensor, woken every 10 captures
        let camera = SyntheticCamera::new([Resolution::new(16, 16)])
            .with_fps(100)
            .with_captures_per_wake(10);
        let (mut source, recorder, events) = source(&camera);

        source.start().unwrap();
        let fps = events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::Fps(rate) => Some(rate),
                _ => None,
            })
            .unwrap();
        source.pause();

        assert!((fps - 100.0).abs() < 1e-6);
        let stats = source.stats();
        assert_eq!(stats.captures_completed(), stats.frames_delivered() * 10);
        assert_eq!(stats.frames_superseded(), stats.frames_delivered() * 9);
        let frames = recorder.frames.lock().unwrap();
        assert!(frames.iter().all(|(seq, _)| seq % 10 == 9));
    }

    /// Opens every session at a fixed size, whatever was asked for.
    struct AdjustingCamera {
        inner: SyntheticCamera,
        actual: Resolution,
    }

    impl CaptureBackend for AdjustingCamera {
        fn devices(&self) -> Result<Vec<crate::capture::DeviceInfo>, CaptureError> {
            self.inner.devices()
        }

        fn supported_sizes(
            &self,
            device: &crate::capture::DeviceInfo,
        ) -> Result<Vec<Resolution>, CaptureError> {
            self.inner.supported_sizes(device)
        }

        fn open(
            &self,
            device: &crate::capture::DeviceInfo,
            _resolution: Resolution,
        ) -> Result<Box<dyn CaptureSession>, CaptureError> {
            self.inner.open(device, self.actual)
        }
    }

    #[test]
    fn publishes_the_negotiated_size_not_the_requested_one() {
        let backend = AdjustingCamera {
            inner: SyntheticCamera::new([Resolution::new(640, 480)]).with_fps(200),
            actual: Resolution::new(320, 240),
        };
        let recorder = Arc::new(Recorder::default());
        let (tx, events) = flume::unbounded();
        let mut source = FrameSource::new(Arc::new(backend), recorder.clone(), tx, config());

        source.start().unwrap();
        assert_eq!(source.resolution(), Some(Resolution::new(320, 240)));
        wait_for(|| !recorder.frames.lock().unwrap().is_empty());
        source.pause();

        assert_eq!(
            *recorder.resolutions.lock().unwrap(),
            vec![Resolution::new(320, 240)]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PipelineEvent::ResolutionChanged(Resolution::new(320, 240))
        );
        let frames = recorder.frames.lock().unwrap();
        assert!(frames.iter().all(|(_, r)| *r == Resolution::new(320, 240)));
    }
}
