//! Position sizing.

use serde::Deserialize;

use crate::core::domain::EPSILON;
use crate::error::{Error, Result};

/// How entry amounts are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    /// Spend a fixed fraction of the free quote balance.
    #[default]
    FixedPct,
    /// Risk a fixed fraction of equity against an ATR-derived stop.
    PercentRisk,
    /// Fixed-fraction base scaled by inverse volatility.
    VolatilityAdjusted,
}

/// Sizing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub method: SizingMethod,
    /// Fraction of capital per entry for `fixed_pct` and the base of
    /// `volatility_adjusted`.
    pub position_size_pct: f64,
    /// Fraction of equity risked per trade for `percent_risk`.
    pub risk_per_trade_pct: f64,
    /// Stop distance multiplier on ATR for `percent_risk`.
    pub atr_multiplier: f64,
    /// Clamp bounds for `volatility_adjusted` amounts.
    pub min_size: f64,
    pub max_size: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::FixedPct,
            position_size_pct: 0.1,
            risk_per_trade_pct: 0.01,
            atr_multiplier: 2.0,
            min_size: 1e-5,
            max_size: 100.0,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.position_size_pct > 0.0 && self.position_size_pct <= 1.0) {
            return Err(Error::InvalidParams(format!(
                "position_size_pct must be in (0, 1], got {}",
                self.position_size_pct
            )));
        }
        if !(self.risk_per_trade_pct >= 0.001 && self.risk_per_trade_pct <= 0.05) {
            return Err(Error::InvalidParams(format!(
                "risk_per_trade_pct must be between 0.001 and 0.05, got {}",
                self.risk_per_trade_pct
            )));
        }
        if self.atr_multiplier <= 0.0 {
            return Err(Error::InvalidParams(
                "atr_multiplier must be positive".into(),
            ));
        }
        if self.min_size <= 0.0 || self.max_size < self.min_size {
            return Err(Error::InvalidParams(
                "sizing bounds must satisfy 0 < min_size <= max_size".into(),
            ));
        }
        Ok(())
    }
}

/// Market context for one sizing decision.
#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    /// Reference price (signal bar close).
    pub price: f64,
    /// Free quote-currency balance.
    pub free_quote: f64,
    /// Total account equity in quote currency.
    pub equity: f64,
    /// Rolling close deviation, when the strategy window had one.
    pub sigma: Option<f64>,
    /// Average true range, when computable.
    pub atr: Option<f64>,
}

/// Compute the order amount in base units for one entry.
pub fn compute_amount(config: &SizingConfig, inputs: &SizingInputs) -> Result<f64> {
    if inputs.price <= 0.0 {
        return Err(Error::InvalidParams(format!(
            "sizing needs a positive price, got {}",
            inputs.price
        )));
    }

    let amount = match config.method {
        SizingMethod::FixedPct => fixed_pct(config, inputs),
        SizingMethod::PercentRisk => percent_risk(config, inputs),
        SizingMethod::VolatilityAdjusted => volatility_adjusted(config, inputs),
    };
    Ok(amount.max(0.0))
}

fn fixed_pct(config: &SizingConfig, inputs: &SizingInputs) -> f64 {
    (inputs.free_quote * config.position_size_pct) / inputs.price
}

fn percent_risk(config: &SizingConfig, inputs: &SizingInputs) -> f64 {
    // Stop distance in price units; without an ATR fall back to the fixed
    // fraction so a young buffer still trades conservatively.
    let Some(atr) = inputs.atr.filter(|atr| *atr > EPSILON) else {
        return fixed_pct(config, inputs);
    };
    let risk_amount = inputs.equity * config.risk_per_trade_pct;
    let stop_distance = config.atr_multiplier * atr;
    risk_amount / stop_distance
}

fn volatility_adjusted(config: &SizingConfig, inputs: &SizingInputs) -> f64 {
    let base = (inputs.equity * config.position_size_pct) / inputs.price;
    let scaled = match inputs.sigma.filter(|sigma| *sigma > EPSILON) {
        Some(sigma) => base / sigma,
        None => base,
    };
    scaled.clamp(config.min_size, config.max_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> SizingInputs {
        SizingInputs {
            price: 100.0,
            free_quote: 10_000.0,
            equity: 20_000.0,
            sigma: Some(2.0),
            atr: Some(1.5),
        }
    }

    #[test]
    fn fixed_pct_spends_fraction_of_free_balance() {
        let config = SizingConfig::default();
        let amount = compute_amount(&config, &inputs()).unwrap();
        // 10% of 10k = 1000 quote → 10 units at price 100.
        assert!((amount - 10.0).abs() < 1e-9);
    }

    #[test]
    fn percent_risk_divides_risk_by_stop_distance() {
        let config = SizingConfig {
            method: SizingMethod::PercentRisk,
            ..SizingConfig::default()
        };
        let amount = compute_amount(&config, &inputs()).unwrap();
        // risk = 1% of 20k = 200; stop = 2 × 1.5 = 3 → 66.66 units.
        assert!((amount - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn percent_risk_without_atr_falls_back() {
        let config = SizingConfig {
            method: SizingMethod::PercentRisk,
            ..SizingConfig::default()
        };
        let mut ctx = inputs();
        ctx.atr = None;
        let amount = compute_amount(&config, &ctx).unwrap();
        assert!((amount - 10.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_adjusted_scales_and_clamps() {
        let config = SizingConfig {
            method: SizingMethod::VolatilityAdjusted,
            max_size: 5.0,
            ..SizingConfig::default()
        };
        // base = 20k × 0.1 / 100 = 20; / sigma 2 = 10 → clamped to 5.
        let amount = compute_amount(&config, &inputs()).unwrap();
        assert!((amount - 5.0).abs() < 1e-9);

        // Calm market (tiny sigma) hits the same cap rather than exploding.
        let mut calm = inputs();
        calm.sigma = Some(1e-12);
        let amount = compute_amount(&config, &calm).unwrap();
        assert!((amount - 5.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_adjusted_floors_at_min_size() {
        let config = SizingConfig {
            method: SizingMethod::VolatilityAdjusted,
            min_size: 0.5,
            ..SizingConfig::default()
        };
        let mut wild = inputs();
        wild.sigma = Some(1e6);
        let amount = compute_amount(&config, &wild).unwrap();
        assert!((amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let config = SizingConfig::default();
        let mut bad = inputs();
        bad.price = 0.0;
        assert!(matches!(
            compute_amount(&config, &bad),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn config_validation() {
        let good = SizingConfig::default();
        assert!(good.validate().is_ok());

        let bad = SizingConfig {
            position_size_pct: 1.5,
            ..SizingConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SizingConfig {
            risk_per_trade_pct: 0.5,
            ..SizingConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SizingConfig {
            min_size: 2.0,
            max_size: 1.0,
            ..SizingConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
