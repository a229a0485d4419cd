//! Deterministic test doubles and builders.
//!
//! Compiled for unit tests and, behind the `testkit` feature, for the
//! integration suite. Nothing here is reachable from a release build.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::core::domain::{Bar, Symbol, Timeframe, Venue};
use crate::core::keys::Clock;

/// A one-minute mock-venue bar with flat OHLC at `close`.
#[must_use]
pub fn bar_at(ts_ms: i64, close: f64) -> Bar {
    Bar {
        venue: Venue::new("mock"),
        symbol: Symbol::normalize("BTCUSDT"),
        ts_ms,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        timeframe: Timeframe::M1,
    }
}

/// Sequential one-minute bars from a list of closes, starting at epoch.
#[must_use]
pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| bar_at(i as i64 * 60_000, *close))
        .collect()
}

/// A [`Clock`] tests can move by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Shared handle starting at `start`.
    #[must_use]
    pub fn shared(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    /// Move time forward.
    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock() += delta;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let before = clock.now();
        clock.advance(TimeDelta::hours(2));
        assert_eq!(clock.now() - before, TimeDelta::hours(2));
    }

    #[test]
    fn bars_are_minute_spaced() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[1].ts_ms - bars[0].ts_ms, 60_000);
        assert_eq!(bars[2].close, 3.0);
    }
}
