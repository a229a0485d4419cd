//! Order dispatch: signals in, sized and risk-checked orders out.
//!
//! Per strategy instance at most one order is in flight; a second signal
//! arriving while one is pending is dropped and counted. Confirmed fills are
//! reconciled back into the strategy runtime; unverified outcomes are
//! quarantined and never touch position state.

mod risk;
mod sizing;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::state::{AppState, QuarantinedOrder};
use crate::core::domain::{OrderRequest, OrderSide, Signal};
use crate::core::executor::ReliableExecutor;
use crate::core::metrics;
use crate::core::strategy::{SignalEnvelope, StrategyId, StrategyRuntime};
use crate::error::Error;

pub use risk::RiskGate;
pub use sizing::{compute_amount, SizingConfig, SizingInputs, SizingMethod};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub sizing: SizingConfig,
    /// Quote currency used for balance and equity lookups.
    pub quote_currency: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sizing: SizingConfig::default(),
            quote_currency: "USDT".to_string(),
        }
    }
}

/// Converts strategy signals into orders through the reliable executor.
pub struct OrderDispatcher {
    executor: Arc<ReliableExecutor>,
    runtime: Arc<StrategyRuntime>,
    state: Arc<AppState>,
    risk: RiskGate,
    config: DispatcherConfig,
    in_flight: DashMap<StrategyId, Uuid>,
}

impl OrderDispatcher {
    pub fn new(
        executor: Arc<ReliableExecutor>,
        runtime: Arc<StrategyRuntime>,
        state: Arc<AppState>,
        config: DispatcherConfig,
    ) -> Self {
        let risk = RiskGate::new(Arc::clone(&state));
        Self {
            executor,
            runtime,
            state,
            risk,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Consume signals until cancellation, then drain in-flight submissions.
    ///
    /// After the cancel signal no new orders are issued; submissions already
    /// in flight run to completion so every order ends reconciled or
    /// quarantined.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<SignalEnvelope>,
        cancel: CancellationToken,
    ) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!("Order dispatcher started");

        loop {
            // Reap finished submissions without blocking.
            while tasks.try_join_next().is_some() {}

            let envelope = tokio::select! {
                () = cancel.cancelled() => break,
                envelope = signals.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                debug!("Signal channel closed");
                break;
            };

            self.accept(envelope, &mut tasks);
        }

        // Drain: reconcile or quarantine everything still in flight.
        let pending = tasks.len();
        if pending > 0 {
            info!(pending, "Draining in-flight orders before shutdown");
        }
        while tasks.join_next().await.is_some() {}
        info!("Order dispatcher stopped");
    }

    fn accept(self: &Arc<Self>, envelope: SignalEnvelope, tasks: &mut JoinSet<()>) {
        let kind = match envelope.signal {
            Signal::Enter { .. } => "enter",
            Signal::Exit { .. } => "exit",
        };
        metrics::DISPATCH
            .signals_received
            .with_label_values(&[envelope.symbol.as_str(), kind])
            .inc();

        // One in-flight order per strategy instance; later signals lose.
        let strategy_id = envelope.strategy_id;
        let claim = Uuid::new_v4();
        let occupied = {
            let entry = self.in_flight.entry(strategy_id);
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => true,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(claim);
                    false
                }
            }
        };
        if occupied {
            metrics::DISPATCH
                .signals_dropped_in_flight
                .with_label_values(&[envelope.symbol.as_str()])
                .inc();
            warn!(
                strategy = %strategy_id,
                signal = ?envelope.signal,
                "Dropping signal: order already in flight"
            );
            return;
        }

        let dispatcher = Arc::clone(self);
        tasks.spawn(async move {
            dispatcher.submit(envelope).await;
            dispatcher.in_flight.remove(&strategy_id);
        });
    }

    async fn submit(&self, envelope: SignalEnvelope) {
        // Submissions use their own token: a supervisor shutdown stops new
        // signals but lets in-flight orders reach a reconciled state.
        let cancel = CancellationToken::new();

        match envelope.signal {
            Signal::Enter { side, size_hint } => {
                self.submit_entry(&envelope, side, size_hint, &cancel).await;
            }
            Signal::Exit { reason } => {
                debug!(strategy = %envelope.strategy_id, reason = %reason, "Exit signal");
                self.submit_exit(&envelope, &cancel).await;
            }
        }
    }

    async fn submit_entry(
        &self,
        envelope: &SignalEnvelope,
        side: OrderSide,
        size_hint: Option<f64>,
        cancel: &CancellationToken,
    ) {
        if !envelope.position.is_flat() {
            warn!(strategy = %envelope.strategy_id, "Entry signal while positioned; dropping");
            return;
        }

        let quote = self.config.quote_currency.as_str();
        let (free_quote, equity) = match self.executor.get_balance(Some(quote), cancel).await {
            Ok(balances) => {
                let balance = balances.get(quote).copied().unwrap_or_default();
                (balance.free, balance.total)
            }
            Err(err) => {
                warn!(error = %err, "Balance fetch failed; dropping entry");
                return;
            }
        };
        self.state.update_equity(equity);

        let computed = match compute_amount(
            &self.config.sizing,
            &SizingInputs {
                price: envelope.close,
                free_quote,
                equity,
                sigma: envelope.sigma,
                atr: envelope.atr,
            },
        ) {
            Ok(amount) => amount,
            Err(err) => {
                warn!(error = %err, "Sizing failed; dropping entry");
                return;
            }
        };
        let amount = size_hint.unwrap_or(computed);

        if let Err(err) = self.risk.check_entry(&envelope.symbol, amount) {
            debug!(strategy = %envelope.strategy_id, error = %err, "Entry rejected");
            return;
        }

        let request = OrderRequest::market(
            envelope.venue.clone(),
            envelope.symbol.clone(),
            side,
            amount,
        );
        self.execute_and_reconcile(envelope, request, cancel).await;
    }

    async fn submit_exit(&self, envelope: &SignalEnvelope, cancel: &CancellationToken) {
        let amount = envelope.position.size.abs();
        if envelope.position.is_flat() {
            warn!(strategy = %envelope.strategy_id, "Exit signal while flat; dropping");
            return;
        }

        let side = if envelope.position.is_long() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let request = OrderRequest::market(
            envelope.venue.clone(),
            envelope.symbol.clone(),
            side,
            amount,
        );
        self.execute_and_reconcile(envelope, request, cancel).await;
    }

    async fn execute_and_reconcile(
        &self,
        envelope: &SignalEnvelope,
        request: OrderRequest,
        cancel: &CancellationToken,
    ) {
        info!(
            strategy = %envelope.strategy_id,
            symbol = %request.symbol,
            side = %request.side,
            amount = request.amount,
            client_id = %request.client_id,
            "Submitting order"
        );

        let outcome = self.executor.place_order(&request, cancel).await;
        match outcome {
            Ok(verified) => {
                if let Some(fill) = verified.confirmed_fill(&request) {
                    match self.runtime.apply_fill(envelope.strategy_id, &fill) {
                        Ok(position) => {
                            // Realized P&L is booked when an exit reduces or
                            // closes the prior position.
                            if matches!(envelope.signal, Signal::Exit { .. }) {
                                let entry = envelope.position.avg_entry_price;
                                let direction = if envelope.position.is_long() { 1.0 } else { -1.0 };
                                let closed = fill.amount.min(envelope.position.size.abs());
                                let pnl = (fill.price - entry) * closed * direction;
                                self.state.record_trade_pnl(pnl);
                            }
                            debug!(
                                strategy = %envelope.strategy_id,
                                size = position.size,
                                avg = position.avg_entry_price,
                                "Position updated"
                            );
                        }
                        Err(err) => {
                            warn!(error = %err, "Fill reconciliation failed");
                        }
                    }
                } else if !verified.verified {
                    metrics::DISPATCH
                        .orders_quarantined
                        .with_label_values(&[request.symbol.as_str()])
                        .inc();
                    warn!(
                        client_id = %request.client_id,
                        order_id = %verified.status.exchange_order_id,
                        "Order unverified; quarantined for operator review"
                    );
                    self.state.quarantine(QuarantinedOrder {
                        request,
                        status: verified.status,
                        strategy_id: Some(envelope.strategy_id),
                        at: chrono::Utc::now(),
                    });
                } else {
                    // Verified terminal without a fill (canceled/rejected).
                    debug!(
                        state = %verified.status.state,
                        "Order ended without a fill"
                    );
                }
            }
            Err(Error::RiskReject(reason)) => {
                debug!(%reason, "Executor rejected order");
            }
            Err(err) => {
                warn!(
                    strategy = %envelope.strategy_id,
                    error = %err,
                    "Order submission failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{Balance, ExitReason, Position, Timeframe, EPSILON};
    use crate::core::exchange::{ExchangeAdapter, MockAdapter, MockBehavior};
    use crate::core::executor::ExecutorConfig;
    use serde_json::json;

    struct Fixture {
        adapter: Arc<MockAdapter>,
        runtime: Arc<StrategyRuntime>,
        state: Arc<AppState>,
        dispatcher: Arc<OrderDispatcher>,
        signal_tx: mpsc::Sender<SignalEnvelope>,
        signal_rx: Option<mpsc::Receiver<SignalEnvelope>>,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new());
        let executor = Arc::new(ReliableExecutor::new(
            Arc::clone(&adapter) as Arc<dyn ExchangeAdapter>,
            ExecutorConfig::default(),
        ));
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let runtime = Arc::new(StrategyRuntime::new(signal_tx.clone()));
        let state = Arc::new(AppState::default());
        let dispatcher = Arc::new(OrderDispatcher::new(
            executor,
            Arc::clone(&runtime),
            Arc::clone(&state),
            DispatcherConfig::default(),
        ));
        Fixture {
            adapter,
            runtime,
            state,
            dispatcher,
            signal_tx,
            signal_rx: Some(signal_rx),
        }
    }

    fn strategy(runtime: &StrategyRuntime) -> StrategyId {
        let id = runtime
            .create(
                "breakout_reset",
                &json!({"lookback_period": 20}),
                "mock".into(),
                "BTCUSDT".into(),
                Timeframe::M1,
            )
            .unwrap();
        runtime.start(id).unwrap();
        id
    }

    fn entry_envelope(id: StrategyId, close: f64) -> SignalEnvelope {
        SignalEnvelope {
            strategy_id: id,
            venue: "mock".into(),
            symbol: "BTCUSDT".into(),
            signal: Signal::enter(OrderSide::Buy),
            close,
            sigma: Some(1.0),
            atr: Some(1.0),
            position: Position::flat(),
        }
    }

    fn exit_envelope(id: StrategyId, position: Position, close: f64) -> SignalEnvelope {
        SignalEnvelope {
            strategy_id: id,
            venue: "mock".into(),
            symbol: "BTCUSDT".into(),
            signal: Signal::exit(ExitReason::StopLoss),
            close,
            sigma: Some(1.0),
            atr: Some(1.0),
            position,
        }
    }

    #[tokio::test]
    async fn entry_signal_fills_and_updates_position() {
        let f = fixture();
        let id = strategy(&f.runtime);
        f.adapter.set_last_price(&"BTCUSDT".into(), 110.0);

        f.dispatcher.submit(entry_envelope(id, 110.0)).await;

        let position = f.runtime.position(id).unwrap();
        // fixed_pct: 10% of 10_000 USDT = 1000 quote → ~9.09 units at 110.
        assert!(position.size > 0.0);
        assert!((position.size - 1000.0 / 110.0).abs() < 1e-6);
        assert!((position.avg_entry_price - 110.0).abs() < EPSILON);
        assert_eq!(f.adapter.place_order_calls(), 1);
    }

    #[tokio::test]
    async fn exit_signal_flattens_position() {
        let f = fixture();
        let id = strategy(&f.runtime);
        f.adapter.set_last_price(&"BTCUSDT".into(), 97.9);

        // Seed a long position.
        f.runtime
            .apply_fill(
                id,
                &crate::core::domain::Fill {
                    side: OrderSide::Buy,
                    amount: 1.0,
                    price: 100.0,
                },
            )
            .unwrap();

        let position = f.runtime.position(id).unwrap();
        f.dispatcher.submit(exit_envelope(id, position, 97.9)).await;

        let flat = f.runtime.position(id).unwrap();
        assert_eq!(flat.size, 0.0);
        assert_eq!(flat.avg_entry_price, 0.0);
        // A losing exit is booked against the loss streak.
        assert_eq!(f.state.consecutive_losses(), 1);
    }

    #[tokio::test]
    async fn risk_reject_drops_entry_without_submission() {
        let f = fixture();
        let id = strategy(&f.runtime);
        // Force a deep drawdown.
        f.state.update_equity(10_000.0);
        f.state.update_equity(1_000.0);

        f.dispatcher.submit(entry_envelope(id, 100.0)).await;

        assert_eq!(f.adapter.place_order_calls(), 0);
        assert!(f.runtime.position(id).unwrap().is_flat());
    }

    #[tokio::test]
    async fn unverified_order_is_quarantined_not_applied() {
        let f = fixture();
        let id = strategy(&f.runtime);
        f.adapter.set_behavior(MockBehavior::NeverFill);

        tokio::time::pause();
        f.dispatcher.submit(entry_envelope(id, 100.0)).await;
        tokio::time::resume();

        assert!(f.runtime.position(id).unwrap().is_flat());
        let parked = f.state.quarantined();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].strategy_id, Some(id));
    }

    #[tokio::test]
    async fn second_signal_while_in_flight_is_dropped() {
        let f = fixture();
        let id = strategy(&f.runtime);
        // Slow venue so the first submission stays in flight.
        f.adapter.set_latency(std::time::Duration::from_millis(200));
        f.adapter.set_last_price(&"BTCUSDT".into(), 100.0);

        let cancel = CancellationToken::new();
        let mut rx = f.signal_rx;
        let run = tokio::spawn(
            Arc::clone(&f.dispatcher).run(rx.take().unwrap(), cancel.clone()),
        );

        f.signal_tx.send(entry_envelope(id, 100.0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        f.signal_tx.send(entry_envelope(id, 100.0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        cancel.cancel();
        run.await.unwrap();

        // Only the first signal reached the venue.
        assert_eq!(f.adapter.place_order_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_orders() {
        let f = fixture();
        let id = strategy(&f.runtime);
        f.adapter.set_latency(std::time::Duration::from_millis(150));
        f.adapter.set_last_price(&"BTCUSDT".into(), 100.0);

        let cancel = CancellationToken::new();
        let mut rx = f.signal_rx;
        let run = tokio::spawn(
            Arc::clone(&f.dispatcher).run(rx.take().unwrap(), cancel.clone()),
        );

        f.signal_tx.send(entry_envelope(id, 100.0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        // Shutdown while the order is still in flight.
        cancel.cancel();
        run.await.unwrap();

        // The in-flight order was reconciled before the dispatcher stopped.
        assert!(!f.runtime.position(id).unwrap().is_flat());
    }

    #[tokio::test]
    async fn balances_feed_equity_tracking() {
        let f = fixture();
        let id = strategy(&f.runtime);
        f.adapter.set_balance(
            "USDT",
            Balance {
                free: 5_000.0,
                used: 1_000.0,
                total: 6_000.0,
            },
        );

        f.dispatcher.submit(entry_envelope(id, 100.0)).await;
        assert!((f.state.equity() - 6_000.0).abs() < 1e-9);
    }
}
