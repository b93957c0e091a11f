//! Lock-free single-slot hand-off between the conversion worker and the display tick

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::convert::ProcessedFrame;

/// Holds at most one frame awaiting display.
///
/// Writes always succeed and replace whatever is pending; the replaced frame is
/// never drawn. Reads take and clear in one atomic swap, so no frame is ever
/// observed twice.
#[derive(Default)]
pub struct PendingFrameSlot {
    frame: ArcSwapOption<ProcessedFrame>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    replaced: AtomicU64,
    taken: AtomicU64,
}

impl PendingFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, frame: ProcessedFrame) {
        self.submit_shared(Arc::new(frame));
    }

    pub fn submit_shared(&self, frame: Arc<ProcessedFrame>) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.frame.swap(Some(frame)).is_some() {
            self.stats.replaced.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("iris_frames_superseded", "stage" => "display").increment(1);
        }
    }

    pub fn take(&self) -> Option<Arc<ProcessedFrame>> {
        let frame = self.frame.swap(None);
        if frame.is_some() {
            self.stats.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.frame.load().is_none()
    }

    pub fn submitted(&self) -> u64 {
        self.stats.submitted.load(Ordering::Relaxed)
    }

    /// Frames overwritten before any tick took them.
    pub fn replaced(&self) -> u64 {
        self.stats.replaced.load(Ordering::Relaxed)
    }

    pub fn taken(&self) -> u64 {
        self.stats.taken.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::Resolution;

    fn frame(sequence: u64) -> ProcessedFrame {
        ProcessedFrame {
            resolution: Resolution::new(1, 1),
            rgba: Bytes::from_static(&[0, 0, 0, 255]),
            conversion_time: Duration::ZERO,
            sequence,
        }
    }

    #[test]
    fn newest_write_wins() {
        let slot = PendingFrameSlot::new();
        slot.submit(frame(1));
        slot.submit(frame(2));
        slot.submit(frame(3));

        assert_eq!(slot.take().unwrap().sequence, 3);
        assert!(slot.take().is_none());
        assert_eq!(slot.replaced(), 2);
        assert_eq!(slot.taken(), 1);
    }

    #[test]
    fn concurrent_takers_never_share_a_frame() {
        let slot = Arc::new(PendingFrameSlot::new());
        let writer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                for seq in 0..10_000 {
                    slot.submit(frame(seq));
                }
            })
        };
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..20_000 {
                        if let Some(f) = slot.take() {
                            seen.push(f.sequence);
                        }
                    }
                    seen
                })
            })
            .collect();

        writer.join().unwrap();
        let mut seen: Vec<u64> = readers
            .into_iter()
            .flat_map(|r| r.join().unwrap())
            .collect();
        seen.extend(slot.take().map(|f| f.sequence));

        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), total);
        assert_eq!(slot.taken() + slot.replaced(), slot.submitted());
    }
}
