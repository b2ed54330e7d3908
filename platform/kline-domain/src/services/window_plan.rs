use crate::value_objects::fetch_window::FetchWindow;
use crate::value_objects::resolution::Resolution;
use crate::value_objects::series::SeriesKey;

/// Open time of the newest bucket that has fully elapsed at `now`.
pub fn last_closed_open(resolution: Resolution, now: i64) -> i64 {
    resolution.align(now) - resolution.seconds()
}

/// Splits `[start, end]` into consecutive windows of at most `max_per_request`
/// buckets. Both bounds are floored to the key's resolution; ids are assigned
/// from `first_id` upwards.
pub fn plan_windows(
    key: &SeriesKey,
    start: i64,
    end: i64,
    max_per_request: usize,
    first_id: u64,
) -> Vec<FetchWindow> {
    let step = key.resolution.seconds();
    let start = key.resolution.align(start);
    let end = key.resolution.align(end);
    if start > end {
        return Vec::new();
    }

    let limit = i64::try_from(max_per_request.max(1)).unwrap_or(i64::MAX);
    let span = step.saturating_mul(limit - 1);

    let mut windows = Vec::new();
    let mut window_start = start;
    let mut id = first_id;
    loop {
        let window_end = window_start.saturating_add(span).min(end);
        windows.push(FetchWindow::new(id, key.clone(), window_start, window_end));
        if window_end >= end {
            break;
        }
        id += 1;
        window_start = window_end + step;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::{last_closed_open, plan_windows};
    use crate::value_objects::exchange::Exchange;
    use crate::value_objects::resolution::Resolution;
    use crate::value_objects::series::SeriesKey;

    fn key() -> SeriesKey {
        SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M1)
    }

    #[test]
    fn windows_cover_range_without_overlap() {
        let windows = plan_windows(&key(), 0, 3_599, 25, 10);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start_time, 0);
        assert_eq!(windows[0].end_time, 24 * 60);
        assert_eq!(windows[1].start_time, 25 * 60);
        assert_eq!(windows[2].end_time, 59 * 60);
        assert_eq!(windows[2].id, 12);
        let total: i64 = windows.iter().map(|w| w.expected_buckets()).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn bounds_are_floored_and_empty_ranges_yield_nothing() {
        let windows = plan_windows(&key(), 61, 130, 1500, 0);
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start_time, windows[0].end_time), (60, 120));
        assert!(plan_windows(&key(), 600, 0, 1500, 0).is_empty());
    }

    #[test]
    fn single_bucket_windows_when_limit_is_one() {
        let windows = plan_windows(&key(), 0, 120, 1, 0);
        let starts: Vec<i64> = windows.iter().map(|w| w.start_time).collect();
        assert_eq!(starts, vec![0, 60, 120]);
    }

    #[test]
    fn last_closed_bucket_excludes_the_one_still_forming() {
        assert_eq!(last_closed_open(Resolution::M1, 1_792_150_467), 1_792_150_380);
        assert_eq!(last_closed_open(Resolution::M1, 1_792_150_440), 1_792_150_380);
        assert_eq!(last_closed_open(Resolution::H1, 7_200), 3_600);
    }
}
