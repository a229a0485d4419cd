//! Breakout-reset strategy.
//!
//! Bollinger-style bands over an N-period rolling mean: enter on a close
//! outside the bands, exit on take-profit, stop-loss, or a reset: price
//! re-crossing the mean by a fraction of the band width on the opposing
//! side. Exits are evaluated before entries on every bar.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::domain::{Bar, ExitReason, OrderSide, Position, Signal};
use crate::error::{Error, Result};

use super::indicators::{mean, sample_std};
use super::{check_range, BarBuffer, Strategy};

/// Tunable parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakoutParams {
    #[serde(default = "default_lookback")]
    pub lookback_period: usize,
    #[serde(default = "default_multiplier")]
    pub volatility_multiplier: f64,
    /// Fraction of the band width the price must re-cross beyond the mean
    /// to trigger the reversion exit.
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold: f64,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

fn default_lookback() -> usize {
    20
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_reset_threshold() -> f64 {
    0.5
}

impl BreakoutParams {
    pub fn validate(&self) -> Result<()> {
        if !(5..=200).contains(&self.lookback_period) {
            return Err(Error::InvalidParams(format!(
                "lookback_period must be between 5 and 200, got {}",
                self.lookback_period
            )));
        }
        if !self.volatility_multiplier.is_finite() || self.volatility_multiplier <= 0.0 {
            return Err(Error::InvalidParams(format!(
                "volatility_multiplier must be positive, got {}",
                self.volatility_multiplier
            )));
        }
        if !self.reset_threshold.is_finite() || self.reset_threshold <= 0.0 {
            return Err(Error::InvalidParams(format!(
                "reset_threshold must be positive, got {}",
                self.reset_threshold
            )));
        }
        if let Some(tp) = self.take_profit {
            check_range("take_profit", tp, 0.001, 1.0)?;
        }
        if let Some(sl) = self.stop_loss {
            check_range("stop_loss", sl, 0.001, 1.0)?;
        }
        Ok(())
    }
}

/// The strategy. Stateless beyond its parameters: bands are recomputed from
/// the runtime-owned history each bar.
pub struct BreakoutReset {
    params: BreakoutParams,
}

impl BreakoutReset {
    pub fn new(params: BreakoutParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn from_params(value: &Value) -> Result<Self> {
        let params: BreakoutParams = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidParams(format!("breakout_reset params: {e}")))?;
        Self::new(params)
    }

    fn bands(&self, history: &BarBuffer) -> Option<(f64, f64, f64)> {
        let closes = history.closes_tail(self.params.lookback_period);
        if closes.len() < self.params.lookback_period {
            return None;
        }
        let sma = mean(&closes)?;
        let sigma = sample_std(&closes)?;
        let offset = self.params.volatility_multiplier * sigma;
        Some((sma, sma + offset, sma - offset))
    }

    fn exit_signal(
        &self,
        close: f64,
        sma: f64,
        band_width: f64,
        position: &Position,
    ) -> Option<Signal> {
        let reset_offset = band_width * self.params.reset_threshold * 0.5;
        let pnl = position.pnl_pct(close)?;

        if let Some(tp) = self.params.take_profit {
            if pnl >= tp {
                return Some(Signal::exit(ExitReason::TakeProfit));
            }
        }
        if let Some(sl) = self.params.stop_loss {
            if pnl <= -sl {
                return Some(Signal::exit(ExitReason::StopLoss));
            }
        }
        if position.is_long() && close < sma - reset_offset {
            return Some(Signal::exit(ExitReason::Reversion));
        }
        if position.is_short() && close > sma + reset_offset {
            return Some(Signal::exit(ExitReason::Reversion));
        }
        None
    }
}

impl Strategy for BreakoutReset {
    fn kind(&self) -> &'static str {
        "breakout_reset"
    }

    fn lookback(&self) -> usize {
        self.params.lookback_period
    }

    fn on_bar(&mut self, bar: &Bar, history: &BarBuffer, position: &Position) -> Option<Signal> {
        let (sma, upper, lower) = self.bands(history)?;
        let close = bar.close;
        let band_width = upper - lower;

        if !position.is_flat() {
            return self.exit_signal(close, sma, band_width, position);
        }

        if close > upper {
            debug!(close, upper, "Breakout above upper band");
            return Some(Signal::enter(OrderSide::Buy));
        }
        if close < lower {
            debug!(close, lower, "Breakdown below lower band");
            return Some(Signal::enter(OrderSide::Sell));
        }
        None
    }
}
