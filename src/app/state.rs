//! Shared runtime state.
//!
//! Tracks account equity, drawdown, daily realized P&L and the loss streak
//! the risk gate consults, plus the quarantine ledger for orders whose venue
//! status never confirmed.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::core::domain::{OrderRequest, OrderStatus};
use crate::core::strategy::StrategyId;

/// Risk-rule thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Reject entries when drawdown from the equity peak exceeds this.
    pub max_drawdown_pct: f64,
    /// Reject entries after this many consecutive losing trades.
    pub max_consecutive_losses: u32,
    /// Reject entries once today's realized loss exceeds this fraction of
    /// the equity peak.
    pub daily_loss_limit_pct: f64,
    /// Venue minimum order amount.
    pub min_order_amount: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 0.2,
            max_consecutive_losses: 5,
            daily_loss_limit_pct: 0.05,
            min_order_amount: 1e-5,
        }
    }
}

#[derive(Debug)]
struct AccountState {
    equity: f64,
    equity_peak: f64,
    daily_realized_pnl: f64,
    day: NaiveDate,
    consecutive_losses: u32,
}

/// An order excluded from position updates, parked for operator review.
#[derive(Debug, Clone)]
pub struct QuarantinedOrder {
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub strategy_id: Option<StrategyId>,
    pub at: DateTime<Utc>,
}

/// Process-shared state behind an `Arc`.
pub struct AppState {
    limits: RiskLimits,
    account: RwLock<AccountState>,
    quarantine: Mutex<Vec<QuarantinedOrder>>,
}

impl AppState {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            account: RwLock::new(AccountState {
                equity: 0.0,
                equity_peak: 0.0,
                daily_realized_pnl: 0.0,
                day: Utc::now().date_naive(),
                consecutive_losses: 0,
            }),
            quarantine: Mutex::new(Vec::new()),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Record the latest observed account equity; the peak ratchets up.
    pub fn update_equity(&self, equity: f64) {
        let mut account = self.account.write();
        account.equity = equity;
        if equity > account.equity_peak {
            account.equity_peak = equity;
        }
    }

    pub fn equity(&self) -> f64 {
        self.account.read().equity
    }

    /// Fractional drawdown from the equity peak; zero before any equity
    /// observation.
    pub fn drawdown_pct(&self) -> f64 {
        let account = self.account.read();
        if account.equity_peak <= 0.0 {
            return 0.0;
        }
        ((account.equity_peak - account.equity) / account.equity_peak).max(0.0)
    }

    /// Record the realized P&L of one closed trade.
    pub fn record_trade_pnl(&self, pnl: f64) {
        let mut account = self.account.write();
        let today = Utc::now().date_naive();
        if account.day != today {
            account.day = today;
            account.daily_realized_pnl = 0.0;
        }
        account.daily_realized_pnl += pnl;
        if pnl < 0.0 {
            account.consecutive_losses += 1;
        } else {
            account.consecutive_losses = 0;
        }
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.account.read().consecutive_losses
    }

    /// Today's realized loss as a fraction of the equity peak (zero when
    /// today is net positive).
    pub fn daily_loss_pct(&self) -> f64 {
        let account = self.account.read();
        if account.equity_peak <= 0.0 || account.daily_realized_pnl >= 0.0 {
            return 0.0;
        }
        -account.daily_realized_pnl / account.equity_peak
    }

    /// Park an order for operator review.
    pub fn quarantine(&self, order: QuarantinedOrder) {
        self.quarantine.lock().push(order);
    }

    /// Snapshot of quarantined orders.
    pub fn quarantined(&self) -> Vec<QuarantinedOrder> {
        self.quarantine.lock().clone()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RiskLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equity_peak_ratchets() {
        let state = AppState::default();
        state.update_equity(1000.0);
        state.update_equity(1200.0);
        state.update_equity(900.0);

        assert_eq!(state.equity(), 900.0);
        assert!((state.drawdown_pct() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn drawdown_zero_without_observations() {
        let state = AppState::default();
        assert_eq!(state.drawdown_pct(), 0.0);
    }

    #[test]
    fn loss_streak_resets_on_win() {
        let state = AppState::default();
        state.record_trade_pnl(-10.0);
        state.record_trade_pnl(-5.0);
        assert_eq!(state.consecutive_losses(), 2);
        state.record_trade_pnl(20.0);
        assert_eq!(state.consecutive_losses(), 0);
    }

    #[test]
    fn daily_loss_fraction_of_peak() {
        let state = AppState::default();
        state.update_equity(1000.0);
        state.record_trade_pnl(-50.0);
        assert!((state.daily_loss_pct() - 0.05).abs() < 1e-9);

        // Gains offset losses.
        state.record_trade_pnl(30.0);
        assert!((state.daily_loss_pct() - 0.02).abs() < 1e-9);
        state.record_trade_pnl(100.0);
        assert_eq!(state.daily_loss_pct(), 0.0);
    }

    #[test]
    fn quarantine_accumulates() {
        use crate::core::domain::{OrderSide, OrderState};

        let state = AppState::default();
        let request = OrderRequest::market("mock".into(), "BTCUSDT".into(), OrderSide::Buy, 1.0);
        state.quarantine(QuarantinedOrder {
            request: request.clone(),
            status: OrderStatus {
                exchange_order_id: "x".into(),
                state: OrderState::Unknown,
                filled_amount: 0.0,
                avg_fill_price: 0.0,
                fee: 0.0,
                raw: None,
            },
            strategy_id: None,
            at: Utc::now(),
        });

        let parked = state.quarantined();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].request.client_id, request.client_id);
    }
}
