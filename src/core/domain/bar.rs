//! OHLCV bars and timeframes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::{Symbol, Venue};

/// Candle interval.
///
/// Parses the spellings venues actually emit: suffix style (`1m`, `1min`,
/// `1h`, `1d`) and bare minutes (`60` means one hour, `1440` one day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Canonical short form (`1m`, `1h`, ...).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Interval length in minutes.
    #[must_use]
    pub fn minutes(&self) -> u64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    /// Interval length as a duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.minutes() * 60)
    }

    /// Interval length in milliseconds.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        (self.minutes() * 60 * 1000) as i64
    }

    fn from_minutes(minutes: u64) -> Option<Self> {
        match minutes {
            1 => Some(Timeframe::M1),
            5 => Some(Timeframe::M5),
            15 => Some(Timeframe::M15),
            30 => Some(Timeframe::M30),
            60 => Some(Timeframe::H1),
            240 => Some(Timeframe::H4),
            1440 => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim().to_ascii_lowercase();

        // Bare-minute spellings like "60" or "1440".
        if let Ok(minutes) = s.parse::<u64>() {
            return Timeframe::from_minutes(minutes)
                .ok_or_else(|| Error::InvalidParams(format!("unsupported timeframe: {raw}")));
        }

        let parsed = match s.as_str() {
            "1m" | "1min" => Some(Timeframe::M1),
            "5m" | "5min" => Some(Timeframe::M5),
            "15m" | "15min" => Some(Timeframe::M15),
            "30m" | "30min" => Some(Timeframe::M30),
            "1h" | "60min" => Some(Timeframe::H1),
            "4h" | "240min" => Some(Timeframe::H4),
            "1d" | "1day" => Some(Timeframe::D1),
            _ => None,
        };
        parsed.ok_or_else(|| Error::InvalidParams(format!("unsupported timeframe: {raw}")))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// One OHLCV sample for a timeframe window.
///
/// Timestamps are millisecond epoch and monotonically non-decreasing per
/// (venue, symbol, timeframe) by the time bars leave the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub venue: Venue,
    pub symbol: Symbol,
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timeframe: Timeframe,
}

impl Bar {
    /// True range against the previous close, used for ATR.
    #[must_use]
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}
