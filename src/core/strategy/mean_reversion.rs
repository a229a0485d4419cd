//! Mean-reversion strategy.
//!
//! Z-score of the close against an N-period rolling mean: enter when price
//! stretches past `entry_z` standard deviations, exit on take-profit,
//! stop-loss, or the z-score crossing back inside `exit_z` toward the mean.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::domain::{Bar, ExitReason, OrderSide, Position, Signal};
use crate::error::{Error, Result};

use super::indicators::z_score;
use super::{check_range, BarBuffer, Strategy};

/// Tunable parameters. `entry_z_score` has no default: picking the stretch
/// threshold is the strategy decision.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeanReversionParams {
    #[serde(default = "default_lookback")]
    pub lookback_period: usize,
    pub entry_z_score: f64,
    #[serde(default = "default_exit_z")]
    pub exit_z_score: f64,
    #[serde(default = "default_take_profit")]
    pub take_profit: f64,
    #[serde(default = "default_stop_loss")]
    pub stop_loss: f64,
}

fn default_lookback() -> usize {
    20
}

fn default_exit_z() -> f64 {
    0.5
}

fn default_take_profit() -> f64 {
    0.03
}

fn default_stop_loss() -> f64 {
    0.02
}

impl MeanReversionParams {
    pub fn validate(&self) -> Result<()> {
        if !(5..=200).contains(&self.lookback_period) {
            return Err(Error::InvalidParams(format!(
                "lookback_period must be between 5 and 200, got {}",
                self.lookback_period
            )));
        }
        check_range("entry_z_score", self.entry_z_score, 1.0, 3.0)?;
        check_range("exit_z_score", self.exit_z_score, 0.1, 1.5)?;
        check_range("take_profit", self.take_profit, 0.001, 1.0)?;
        check_range("stop_loss", self.stop_loss, 0.001, 1.0)?;
        Ok(())
    }
}

/// The strategy.
pub struct MeanReversion {
    params: MeanReversionParams,
}

impl MeanReversion {
    pub fn new(params: MeanReversionParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn from_params(value: &Value) -> Result<Self> {
        let params: MeanReversionParams = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidParams(format!("mean_reversion params: {e}")))?;
        Self::new(params)
    }

    fn exit_signal(&self, z: f64, close: f64, position: &Position) -> Option<Signal> {
        let pnl = position.pnl_pct(close)?;
        if pnl >= self.params.take_profit {
            return Some(Signal::exit(ExitReason::TakeProfit));
        }
        if pnl <= -self.params.stop_loss {
            return Some(Signal::exit(ExitReason::StopLoss));
        }
        // Long positions entered below the mean exit once z climbs back past
        // −exit_z; shorts mirror.
        if position.is_long() && z >= -self.params.exit_z_score {
            return Some(Signal::exit(ExitReason::Reversion));
        }
        if position.is_short() && z <= self.params.exit_z_score {
            return Some(Signal::exit(ExitReason::Reversion));
        }
        None
    }
}

impl Strategy for MeanReversion {
    fn kind(&self) -> &'static str {
        "mean_reversion"
    }

    fn lookback(&self) -> usize {
        self.params.lookback_period
    }

    fn on_bar(&mut self, bar: &Bar, history: &BarBuffer, position: &Position) -> Option<Signal> {
        let closes = history.closes_tail(self.params.lookback_period);
        if closes.len() < self.params.lookback_period {
            return None;
        }
        let z = z_score(bar.close, &closes)?;

        if !position.is_flat() {
            return self.exit_signal(z, bar.close, position);
        }

        if z < -self.params.entry_z_score {
            debug!(z, close = bar.close, "Oversold; entering long");
            return Some(Signal::enter(OrderSide::Buy));
        }
        if z > self.params.entry_z_score {
            debug!(z, close = bar.close, "Overbought; entering short");
            return Some(Signal::enter(OrderSide::Sell));
        }
        None
    }
}
