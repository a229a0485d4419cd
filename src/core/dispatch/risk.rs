//! Pre-submission risk gate.
//!
//! Ordered checks against shared account state; the first violated rule
//! rejects the order with a typed reason.

use std::sync::Arc;

use tracing::warn;

use crate::app::state::AppState;
use crate::core::domain::Symbol;
use crate::core::metrics;
use crate::error::{Error, Result};

/// Risk gate consulted before every entry order.
pub struct RiskGate {
    state: Arc<AppState>,
}

impl RiskGate {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Check an entry of `amount` base units. Exits are never blocked:
    /// reducing exposure is always allowed.
    pub fn check_entry(&self, symbol: &Symbol, amount: f64) -> Result<()> {
        let limits = self.state.limits();

        let drawdown = self.state.drawdown_pct();
        if drawdown > limits.max_drawdown_pct {
            return self.reject(
                symbol,
                "max_drawdown",
                format!(
                    "drawdown {:.2}% over limit {:.2}%",
                    drawdown * 100.0,
                    limits.max_drawdown_pct * 100.0
                ),
            );
        }

        let losses = self.state.consecutive_losses();
        if losses >= limits.max_consecutive_losses {
            return self.reject(
                symbol,
                "consecutive_losses",
                format!("{losses} consecutive losses"),
            );
        }

        let daily_loss = self.state.daily_loss_pct();
        if daily_loss >= limits.daily_loss_limit_pct {
            return self.reject(
                symbol,
                "daily_loss",
                format!("daily loss {:.2}% at limit", daily_loss * 100.0),
            );
        }

        if amount < limits.min_order_amount {
            return self.reject(
                symbol,
                "min_amount",
                format!(
                    "amount {amount} below venue minimum {}",
                    limits.min_order_amount
                ),
            );
        }

        Ok(())
    }

    fn reject(&self, symbol: &Symbol, rule: &str, reason: String) -> Result<()> {
        metrics::DISPATCH
            .risk_rejects
            .with_label_values(&[symbol.as_str(), rule])
            .inc();
        warn!(symbol = %symbol, rule, %reason, "Risk gate rejected entry");
        Err(Error::RiskReject(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::state::RiskLimits;

    fn gate(limits: RiskLimits) -> (Arc<AppState>, RiskGate) {
        let state = Arc::new(AppState::new(limits));
        let gate = RiskGate::new(Arc::clone(&state));
        (state, gate)
    }

    fn symbol() -> Symbol {
        "BTCUSDT".into()
    }

    #[test]
    fn healthy_state_passes() {
        let (state, gate) = gate(RiskLimits::default());
        state.update_equity(10_000.0);
        assert!(gate.check_entry(&symbol(), 1.0).is_ok());
    }

    #[test]
    fn drawdown_rejects() {
        let (state, gate) = gate(RiskLimits {
            max_drawdown_pct: 0.1,
            ..RiskLimits::default()
        });
        state.update_equity(10_000.0);
        state.update_equity(8_500.0); // 15% drawdown

        assert!(matches!(
            gate.check_entry(&symbol(), 1.0),
            Err(Error::RiskReject(_))
        ));
    }

    #[test]
    fn loss_streak_rejects() {
        let (state, gate) = gate(RiskLimits {
            max_consecutive_losses: 3,
            ..RiskLimits::default()
        });
        state.update_equity(10_000.0);
        for _ in 0..3 {
            state.record_trade_pnl(-10.0);
        }
        assert!(matches!(
            gate.check_entry(&symbol(), 1.0),
            Err(Error::RiskReject(_))
        ));
    }

    #[test]
    fn daily_loss_rejects() {
        let (state, gate) = gate(RiskLimits {
            daily_loss_limit_pct: 0.05,
            ..RiskLimits::default()
        });
        state.update_equity(10_000.0);
        state.record_trade_pnl(-600.0); // 6% of peak

        assert!(matches!(
            gate.check_entry(&symbol(), 1.0),
            Err(Error::RiskReject(_))
        ));
    }

    #[test]
    fn dust_amount_rejects() {
        let (state, gate) = gate(RiskLimits {
            min_order_amount: 0.01,
            ..RiskLimits::default()
        });
        state.update_equity(10_000.0);
        assert!(matches!(
            gate.check_entry(&symbol(), 0.001),
            Err(Error::RiskReject(_))
        ));
        assert!(gate.check_entry(&symbol(), 0.01).is_ok());
    }
}
