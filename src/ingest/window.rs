//! Date windows to re-query for a stream

use chrono::{Datelike, Duration, NaiveDate};

/// Step between window boundaries before the floor is reached
pub const WINDOW_STEP_DAYS: i64 = 30;

/// Days re-fetched before the latest stored day to absorb late data
pub const OVERLAP_DAYS: i64 = 2;

/// One query range, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

/// Oldest day that must be re-queried
pub fn floor_day(explicit_start: Option<NaiveDate>, latest_stored: Option<NaiveDate>, epoch: NaiveDate) -> NaiveDate {
    match (explicit_start, latest_stored) {
        (Some(start), _) => start,
        (None, Some(latest)) => latest - Duration::days(OVERLAP_DAYS),
        (None, None) => epoch,
    }
}

/// Window start boundaries, most recent first, ending with the floor.
///
/// Boundaries step back 30 days from the first of the current month and stop
/// before reaching the floor's month.
pub fn plan_boundaries(
    explicit_start: Option<NaiveDate>,
    latest_stored: Option<NaiveDate>,
    today: NaiveDate,
    epoch: NaiveDate,
) -> Vec<NaiveDate> {
    let floor = floor_day(explicit_start, latest_stored, epoch);
    let floor_month = month_start(floor);

    let mut boundaries = Vec::new();
    let mut current = month_start(today);
    while month_start(current) > floor_month {
        boundaries.push(current);
        current -= Duration::days(WINDOW_STEP_DAYS);
    }
    boundaries.push(floor);
    boundaries
}

/// Pair boundaries into non-overlapping windows, most recent first. Each
/// window ends the day before the previous (more recent) one starts; the
/// first ends today. Empty windows (a start after today) are dropped.
pub fn plan_windows(
    explicit_start: Option<NaiveDate>,
    latest_stored: Option<NaiveDate>,
    today: NaiveDate,
    epoch: NaiveDate,
) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut end = today;
    for start in plan_boundaries(explicit_start, latest_stored, today, epoch) {
        if start <= end {
            windows.push(Window { start, end });
        }
        end = start - Duration::days(1);
    }
    windows
}
