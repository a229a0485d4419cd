//! Normalized ticker snapshot.

use serde::{Deserialize, Serialize};

use super::Symbol;

/// Best bid/ask and last trade price for one symbol.
///
/// Venue-specific extras survive only in the opaque `raw` attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl Ticker {
    /// Midpoint of the current spread.
    #[must_use]
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Absolute spread.
    #[must_use]
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}
