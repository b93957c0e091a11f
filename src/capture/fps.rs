//! Rolling frame-rate estimate from hardware capture timestamps.

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Samples averaged per emission.
pub const FPS_WINDOW: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    Tracking { last_ns: i64 },
}

/// Folds instantaneous rates into a fixed window and emits the mean once per window.
///
/// A non-positive delta is skipped, but its timestamp still replaces the stored
/// one so a single corrupt value cannot skew every following delta.
#[derive(Debug, Clone)]
pub struct FrameRateEstimator {
    state: State,
    window: u32,
    sum: f64,
    count: u32,
}

impl Default for FrameRateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRateEstimator {
    pub fn new() -> Self {
        Self::with_window(FPS_WINDOW)
    }

    pub fn with_window(window: u32) -> Self {
        Self {
            state: State::Idle,
            window: window.max(1),
            sum: 0.0,
            count: 0,
        }
    }

    /// Feed one timestamp, returning the window average when it completes.
    pub fn record(&mut self, timestamp_ns: i64) -> Option<f64> {
        let previous = std::mem::replace(
            &mut self.state,
            State::Tracking {
                last_ns: timestamp_ns,
            },
        );

        let State::Tracking { last_ns } = previous else {
            return None;
        };

        let delta = timestamp_ns.saturating_sub(last_ns);
        if delta <= 0 {
            tracing::debug!(delta, "skipping non-positive timestamp delta");
            return None;
        }

        self.sum += NANOS_PER_SEC / delta as f64;
        self.count += 1;
        if self.count < self.window {
            return None;
        }

        let fps = self.sum / self.count as f64;
        self.sum = 0.0;
        self.count = 0;
        Some(fps)
    }

    /// Forget the stored timestamp and any partial window.
    pub fn reset(&mut self) {
        *self = Self::with_window(self.window);
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, State::Tracking { .. })
    }
}
