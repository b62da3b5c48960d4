//! Cycle-time estimation from arrival timestamps
//!
//! Timestamps are offsets from the start of the observation window, in
//! arrival order. Results are rounded to the nearest millisecond.

use std::time::Duration;

/// Gap between the first two arrivals
pub fn single_shot_cycle(arrivals: &[Duration]) -> Option<u32> {
    match arrivals {
        [first, second, ..] => Some(round_ms(second.saturating_sub(*first).as_micros(), 1)),
        _ => None,
    }
}

/// Fewest arrivals the windowed estimator accepts for a given discard count
pub fn min_occurrences(discard: usize) -> usize {
    discard.max(1) + 1
}

/// Mean gap ending at the occurrences that survive the discard
///
/// The first `discard` occurrences only serve as gap start points, so with
/// the default of 4 at least 5 occurrences are needed.
pub fn windowed_cycle(timestamps: &[Duration], discard: usize) -> Option<u32> {
    let first = discard.max(1);
    let n = timestamps.len();
    if n < min_occurrences(discard) {
        return None;
    }

    // Sum of consecutive gaps telescopes to last - first start point
    let span = timestamps[n - 1].saturating_sub(timestamps[first - 1]);
    Some(round_ms(span.as_micros(), (n - first) as u128))
}

fn round_ms(total_us: u128, count: u128) -> u32 {
    let divisor = count * 1000;
    let rounded = (total_us + divisor / 2) / divisor;
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_millis(v)).collect()
    }

    #[test]
    fn test_single_shot_needs_two_arrivals() {
        assert_eq!(single_shot_cycle(&[]), None);
        assert_eq!(single_shot_cycle(&ms(&[10])), None);
        assert_eq!(single_shot_cycle(&ms(&[10, 55, 90])), Some(45));
    }

    #[test]
    fn test_single_shot_rounds_to_nearest_ms() {
        let arrivals = [Duration::from_micros(0), Duration::from_micros(44_600)];
        assert_eq!(single_shot_cycle(&arrivals), Some(45));
    }

    #[test]
    fn test_windowed_six_arrivals_at_100ms() {
        let stamps = ms(&[0, 100, 200, 300, 400, 500]);
        assert_eq!(windowed_cycle(&stamps, 4), Some(100));
    }

    #[test]
    fn test_windowed_ignores_startup_jitter() {
        // Bursty start, then a steady 20 ms cycle
        let stamps = ms(&[0, 1, 2, 3, 20, 40, 60]);
        assert_eq!(windowed_cycle(&stamps, 4), Some(19));
        let steady = ms(&[0, 1, 2, 3, 23, 43, 63]);
        assert_eq!(windowed_cycle(&steady, 4), Some(20));
    }

    #[test]
    fn test_windowed_minimum_occurrences() {
        assert_eq!(windowed_cycle(&ms(&[0, 10, 20, 30]), 4), None);
        assert_eq!(windowed_cycle(&ms(&[0, 10, 20, 30, 40]), 4), Some(10));
        assert_eq!(windowed_cycle(&[], 4), None);
    }

    #[test]
    fn test_windowed_zero_discard_uses_every_gap() {
        assert_eq!(min_occurrences(0), 2);
        assert_eq!(windowed_cycle(&ms(&[5, 15, 35]), 0), Some(15));
    }

    #[test]
    fn test_estimation_is_deterministic() {
        let stamps = ms(&[0, 45, 90, 135, 180, 225, 270]);
        assert_eq!(windowed_cycle(&stamps, 4), windowed_cycle(&stamps, 4));
        assert_eq!(windowed_cycle(&stamps, 4), Some(45));
    }
}
