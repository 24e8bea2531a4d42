//! Watermark derivation.
//!
//! The pipeline runs a single global watermark derived from processing
//! time: `watermark = now − allowed_lateness`. Events whose window opened
//! before the watermark go to the late stream; windows whose end the
//! watermark has passed are finalized. Keeping the derivation in this one
//! module lets a per-key event-time watermark be swapped in later without
//! touching the workers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use meterflow_core::TimeWindow;

/// A position in event time past which no more on-time events are admitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// Derive the watermark from processing time.
    pub fn derive(now: DateTime<Utc>, allowed_lateness: Duration) -> Self {
        Self(now - allowed_lateness)
    }

    pub fn at(position: DateTime<Utc>) -> Self {
        Self(position)
    }

    pub fn position(&self) -> DateTime<Utc> {
        self.0
    }

    /// A window whose start the watermark has passed no longer admits
    /// events; anything arriving for it is late.
    pub fn is_late(&self, window: &TimeWindow) -> bool {
        window.start() < self.0
    }

    /// A window is complete once the watermark passes its end.
    pub fn closes(&self, window: &TimeWindow) -> bool {
        window.end() <= self.0
    }
}

impl core::fmt::Display for Watermark {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn derivation_lags_processing_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let wm = Watermark::derive(now, Duration::hours(1));
        assert_eq!(wm.position(), now - Duration::hours(1));
    }

    #[test]
    fn lateness_and_closure_are_distinct() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::hours(1)).unwrap();

        // Watermark past the start: arrivals are late, but the window is
        // not yet complete.
        let wm = Watermark::at(start + Duration::minutes(30));
        assert!(wm.is_late(&window));
        assert!(!wm.closes(&window));

        // Watermark before the window start: on time.
        let wm = Watermark::at(start);
        assert!(!wm.is_late(&window));

        // Watermark exactly at the window end: closes.
        let wm = Watermark::at(start + Duration::hours(1));
        assert!(wm.closes(&window));
    }
}
