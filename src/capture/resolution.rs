use crate::capture::frame::Resolution;

/// Used when a device reports no sizes for the planar format.
pub const FALLBACK_RESOLUTION: Resolution = Resolution::new(1280, 720);

/// Pick the size whose area is closest to `target`'s; the first candidate wins ties.
pub fn select_resolution(candidates: &[Resolution], target: Resolution) -> Resolution {
    let target_area = target.area();
    candidates
        .iter()
        .copied()
        .reduce(|best, candidate| {
            if candidate.area().abs_diff(target_area) < best.area().abs_diff(target_area) {
                candidate
            } else {
                best
            }
        })
        .unwrap_or(FALLBACK_RESOLUTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(u32, u32)]) -> Vec<Resolution> {
        list.iter().copied().map(Resolution::from).collect()
    }

    #[test]
    fn exact_area_match_wins() {
        let candidates = sizes(&[(640, 480), (1920, 1080), (1280, 720), (1296, 730)]);
        assert_eq!(
            select_resolution(&candidates, Resolution::new(1280, 720)),
            Resolution::new(1280, 720)
        );
    }

    #[test]
    fn ties_keep_first_candidate() {
        // Both are 100 pixels away from the target area of 100
        let candidates = sizes(&[(10, 20), (20, 10), (5, 0)]);
        assert_eq!(
            select_resolution(&candidates, Resolution::new(10, 10)),
            Resolution::new(10, 20)
        );
    }

    #[test]
    fn closest_area_not_closest_width() {
        let candidates = sizes(&[(1280, 960), (1600, 600)]);
        // 1228800 vs 960000 against 921600
        assert_eq!(
            select_resolution(&candidates, Resolution::new(1280, 720)),
            Resolution::new(1600, 600)
        );
    }

    #[test]
    fn empty_list_falls_back() {
        assert_eq!(
            select_resolution(&[], Resolution::new(640, 480)),
            FALLBACK_RESOLUTION
        );
    }
}
