//! Venue and symbol identifiers.
//!
//! Symbols arrive in many spellings (`BTC/USDT`, `btc-usdt`, `BTCUSDT`); the
//! engine normalizes them once at the boundary and compares the normalized
//! form everywhere else.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a trading venue (e.g. `binance`, `kraken`, `mock`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Venue(String);

impl Venue {
    /// Create a venue id. Lowercased so `Binance` and `binance` compare equal.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    /// Get the underlying name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Venue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Normalized trading-pair symbol.
///
/// Normalization strips pair separators and uppercases: `BTC/USDT`,
/// `btc-usdt` and `BTC_USDT` all become `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw symbol string.
    pub fn normalize(raw: impl AsRef<str>) -> Self {
        let normalized: String = raw
            .as_ref()
            .trim()
            .chars()
            .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self(normalized)
    }

    /// Get the normalized symbol string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when normalization produced an empty symbol.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::normalize(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalization_strips_separators() {
        assert_eq!(Symbol::normalize("BTC/USDT").as_str(), "BTCUSDT");
        assert_eq!(Symbol::normalize("btc-usdt").as_str(), "BTCUSDT");
        assert_eq!(Symbol::normalize("ETH_USDT").as_str(), "ETHUSDT");
        assert_eq!(Symbol::normalize(" SOLUSDT ").as_str(), "SOLUSDT");
    }

    #[test]
    fn normalized_forms_compare_equal() {
        assert_eq!(Symbol::normalize("BTC/USDT"), Symbol::normalize("btcusdt"));
    }

    #[test]
    fn venue_is_case_insensitive() {
        assert_eq!(Venue::new("Binance"), Venue::new("binance"));
        assert_eq!(Venue::new(" Kraken ").as_str(), "kraken");
    }
}
