//! Event-time windows.
//!
//! Windows are half-open intervals `[start, end)` aligned to integral
//! multiples of the window size, computed from millisecond event time.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A half-open, size-aligned event-time window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build a window from explicit bounds.
    ///
    /// Invariant: `start < end`. Alignment is checked separately (it depends
    /// on the window size, see [`TimeWindow::is_aligned`]).
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, DomainError> {
        if start >= end {
            return Err(DomainError::invariant("window start must precede end"));
        }
        Ok(Self { start, end })
    }

    /// The aligned window containing `event_time` for the given size.
    pub fn containing(event_time: DateTime<Utc>, size: Duration) -> Result<Self, DomainError> {
        let size_ms = size.num_milliseconds();
        if size_ms <= 0 {
            return Err(DomainError::validation("window size must be positive"));
        }

        let ts = event_time.timestamp_millis();
        // Euclidean division keeps pre-epoch timestamps in their natural window.
        let start_ms = ts.div_euclid(size_ms) * size_ms;
        let end_ms = start_ms
            .checked_add(size_ms)
            .ok_or_else(|| DomainError::invariant("window end overflow"))?;

        Ok(Self {
            start: millis_to_utc(start_ms)?,
            end: millis_to_utc(end_ms)?,
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// `true` when `t` falls inside `[start, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// `true` when the window start is an integral multiple of `size`.
    pub fn is_aligned(&self, size: Duration) -> bool {
        let size_ms = size.num_milliseconds();
        size_ms > 0
            && self.start.timestamp_millis().rem_euclid(size_ms) == 0
            && (self.end - self.start) == size
    }
}

impl core::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, DomainError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DomainError::validation(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour() -> Duration {
        Duration::hours(1)
    }

    #[test]
    fn events_in_same_hour_share_a_window() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::minutes(59) + Duration::seconds(59);

        let w0 = TimeWindow::containing(t0, hour()).unwrap();
        assert_eq!(w0, TimeWindow::containing(t1, hour()).unwrap());
        assert_eq!(w0, TimeWindow::containing(t2, hour()).unwrap());

        assert_eq!(w0.start(), t0);
        assert_eq!(w0.end(), t0 + hour());
    }

    #[test]
    fn window_boundary_belongs_to_the_next_window() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let w = TimeWindow::containing(t, hour()).unwrap();
        assert_eq!(w.start(), t);
    }

    #[test]
    fn windows_are_aligned() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 42, 7).unwrap();
        let w = TimeWindow::containing(t, hour()).unwrap();
        assert!(w.is_aligned(hour()));
        assert!(w.contains(t));
        assert!(!w.contains(w.end()));
    }

    #[test]
    fn degenerate_bounds_rejected() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert!(TimeWindow::new(t, t).is_err());
        assert!(TimeWindow::containing(t, Duration::zero()).is_err());
    }
}
