//! Strategy contract and reference implementations.
//!
//! A strategy is a pure per-bar state machine: it sees the newest bar, the
//! rolling history and a read-only view of its position, and may emit a
//! [`Signal`]. Everything side-effectful (sizing, risk, submission, fills)
//! lives in the dispatcher.

mod breakout_reset;
pub mod indicators;
mod mean_reversion;
mod runtime;

use std::collections::VecDeque;

use serde_json::Value;

use crate::core::domain::{Bar, Position, Signal};
use crate::error::{Error, Result};

pub use breakout_reset::{BreakoutParams, BreakoutReset};
pub use mean_reversion::{MeanReversion, MeanReversionParams};
pub use runtime::{
    InstanceInfo, InstanceStatus, SignalEnvelope, StrategyId, StrategyRuntime,
};

/// The per-bar strategy contract.
pub trait Strategy: Send {
    /// Stable kind name (`breakout_reset`, `mean_reversion`).
    fn kind(&self) -> &'static str;

    /// Bars required before evaluation starts.
    fn lookback(&self) -> usize;

    /// Evaluate one bar. Exits are expected to win over entries.
    fn on_bar(&mut self, bar: &Bar, history: &BarBuffer, position: &Position) -> Option<Signal>;
}

/// Bounded, ordered bar history owned by one strategy instance.
///
/// Capacity is fixed at twice the strategy's lookback; older bars fall off
/// the front on append.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    bars: VecDeque<Bar>,
    max_len: usize,
}

impl BarBuffer {
    #[must_use]
    pub fn new(lookback: usize) -> Self {
        let max_len = (lookback * 2).max(1);
        Self {
            bars: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Append a bar and trim to capacity.
    pub fn push(&mut self, bar: Bar) {
        if self.bars.len() == self.max_len {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Closing prices of the most recent `n` bars, oldest first.
    #[must_use]
    pub fn closes_tail(&self, n: usize) -> Vec<f64> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).map(|b| b.close).collect()
    }

    /// The most recent `n` bars, oldest first.
    #[must_use]
    pub fn bars_tail(&self, n: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).cloned().collect()
    }

    /// The most recent bar.
    #[must_use]
    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }
}

/// Build a strategy instance from its kind name and JSON params.
pub fn build_strategy(kind: &str, params: &Value) -> Result<Box<dyn Strategy>> {
    match kind {
        "breakout_reset" => Ok(Box::new(BreakoutReset::from_params(params)?)),
        "mean_reversion" => Ok(Box::new(MeanReversion::from_params(params)?)),
        other => Err(Error::InvalidParams(format!(
            "unknown strategy kind: {other}"
        ))),
    }
}

/// Validate params without instantiating (pure, for the control surface).
pub fn validate_params(kind: &str, params: &Value) -> Result<()> {
    build_strategy(kind, params).map(|_| ())
}

/// Range check shared by strategy param validation.
pub(crate) fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(Error::InvalidParams(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::bar_at;
    use serde_json::json;

    #[test]
    fn buffer_trims_to_twice_lookback() {
        let mut buffer = BarBuffer::new(5);
        for i in 0..25 {
            buffer.push(bar_at(i * 60_000, 100.0 + i as f64));
        }
        assert_eq!(buffer.len(), 10);
        // Oldest retained bar is i = 15.
        assert_eq!(buffer.closes_tail(10)[0], 115.0);
        assert_eq!(buffer.last().unwrap().close, 124.0);
    }

    #[test]
    fn closes_tail_shorter_than_request() {
        let mut buffer = BarBuffer::new(10);
        buffer.push(bar_at(0, 1.0));
        buffer.push(bar_at(60_000, 2.0));
        assert_eq!(buffer.closes_tail(5), vec![1.0, 2.0]);
    }

    #[test]
    fn registry_builds_known_kinds() {
        let breakout = build_strategy("breakout_reset", &json!({"lookback_period": 20}));
        assert!(breakout.is_ok());
        let mr = build_strategy(
            "mean_reversion",
            &json!({"lookback_period": 20, "entry_z_score": 2.0}),
        );
        assert!(mr.is_ok());
    }

    #[test]
    fn registry_rejects_unknown_kind() {
        assert!(matches!(
            build_strategy("momentum", &json!({})),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn validate_params_is_pure_passthrough() {
        assert!(validate_params("breakout_reset", &json!({"lookback_period": 20})).is_ok());
        assert!(validate_params("breakout_reset", &json!({"lookback_period": 1})).is_err());
    }
}
