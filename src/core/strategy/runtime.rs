//! Strategy runtime: hosts instances, feeds bars, reconciles fills.
//!
//! Each instance exclusively owns its bar buffer and position. Workers are
//! per-instance tasks: one strategy blowing up (or falling behind) never
//! interrupts the others. Signals leave through a bounded channel to the
//! dispatcher; the runtime never submits orders itself.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::data::{BarEvent, BarReceiver};
use crate::core::domain::{Bar, Fill, Position, Signal, Symbol, Timeframe, Venue};
use crate::core::strategy::indicators::{average_true_range, sample_std};
use crate::error::{Error, Result};

use super::{build_strategy, BarBuffer, Strategy};

/// Identifier of one hosted strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StrategyId(Uuid);

impl StrategyId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StrategyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strat-{}", self.0)
    }
}

/// Instance run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Paused,
    Stopped,
}

/// A signal plus the market context the dispatcher needs for sizing.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub strategy_id: StrategyId,
    pub venue: Venue,
    pub symbol: Symbol,
    pub signal: Signal,
    /// Close of the bar that produced the signal.
    pub close: f64,
    /// Rolling sample deviation of closes over the lookback, if computable.
    pub sigma: Option<f64>,
    /// Average true range over the lookback, if computable.
    pub atr: Option<f64>,
    /// Position snapshot at signal time.
    pub position: Position,
}

/// Read-only instance summary for the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceInfo {
    pub id: StrategyId,
    pub kind: &'static str,
    pub venue: Venue,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub status: InstanceStatus,
    pub position: Position,
}

struct Instance {
    id: StrategyId,
    venue: Venue,
    symbol: Symbol,
    timeframe: Timeframe,
    strategy: Box<dyn Strategy>,
    buffer: BarBuffer,
    position: Position,
    status: InstanceStatus,
}

/// Hosts all strategy instances.
pub struct StrategyRuntime {
    instances: DashMap<StrategyId, Arc<Mutex<Instance>>>,
    signal_tx: mpsc::Sender<SignalEnvelope>,
}

impl StrategyRuntime {
    pub fn new(signal_tx: mpsc::Sender<SignalEnvelope>) -> Self {
        Self {
            instances: DashMap::new(),
            signal_tx,
        }
    }

    /// Create an instance. Params are validated here; instances start
    /// `Stopped` until started.
    pub fn create(
        &self,
        kind: &str,
        params: &Value,
        venue: Venue,
        symbol: Symbol,
        timeframe: Timeframe,
    ) -> Result<StrategyId> {
        let strategy = build_strategy(kind, params)?;
        let id = StrategyId::new();
        let lookback = strategy.lookback();
        let instance = Instance {
            id,
            venue: venue.clone(),
            symbol: symbol.clone(),
            timeframe,
            strategy,
            buffer: BarBuffer::new(lookback),
            position: Position::flat(),
            status: InstanceStatus::Stopped,
        };
        self.instances.insert(id, Arc::new(Mutex::new(instance)));
        info!(strategy = %id, kind, venue = %venue, symbol = %symbol, "Strategy created");
        Ok(id)
    }

    fn instance(&self, id: StrategyId) -> Result<Arc<Mutex<Instance>>> {
        self.instances
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(format!("strategy {id}")))
    }

    /// Mark an instance running.
    pub fn start(&self, id: StrategyId) -> Result<()> {
        let instance = self.instance(id)?;
        let mut guard = instance.lock();
        guard.status = InstanceStatus::Running;
        info!(strategy = %id, "Strategy started");
        Ok(())
    }

    /// Pause bar evaluation without dropping buffered history.
    pub fn pause(&self, id: StrategyId) -> Result<()> {
        let instance = self.instance(id)?;
        instance.lock().status = InstanceStatus::Paused;
        info!(strategy = %id, "Strategy paused");
        Ok(())
    }

    /// Stop an instance. Its position survives for inspection.
    pub fn stop(&self, id: StrategyId) -> Result<()> {
        let instance = self.instance(id)?;
        instance.lock().status = InstanceStatus::Stopped;
        info!(strategy = %id, "Strategy stopped");
        Ok(())
    }

    /// Current position of an instance.
    pub fn position(&self, id: StrategyId) -> Result<Position> {
        Ok(self.instance(id)?.lock().position)
    }

    /// Summaries of all instances.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.instances
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                InstanceInfo {
                    id: guard.id,
                    kind: guard.strategy.kind(),
                    venue: guard.venue.clone(),
                    symbol: guard.symbol.clone(),
                    timeframe: guard.timeframe,
                    status: guard.status,
                    position: guard.position,
                }
            })
            .collect()
    }

    /// Apply a confirmed fill to an instance's position.
    pub fn apply_fill(&self, id: StrategyId, fill: &Fill) -> Result<Position> {
        let instance = self.instance(id)?;
        let mut guard = instance.lock();
        let before = guard.position;
        guard.position.apply_fill(fill);
        info!(
            strategy = %id,
            side = %fill.side,
            amount = fill.amount,
            price = fill.price,
            size_before = before.size,
            size_after = guard.position.size,
            "Fill reconciled"
        );
        Ok(guard.position)
    }

    /// Feed one bar through an instance. Returns the signal envelope when
    /// the strategy emitted one.
    pub fn process_bar(&self, id: StrategyId, bar: &Bar) -> Result<Option<SignalEnvelope>> {
        let instance = self.instance(id)?;
        let mut guard = instance.lock();
        if guard.status != InstanceStatus::Running {
            return Ok(None);
        }

        guard.buffer.push(bar.clone());
        let lookback = guard.strategy.lookback();
        if guard.buffer.len() < lookback {
            debug!(
                strategy = %id,
                have = guard.buffer.len(),
                need = lookback,
                "Warming up"
            );
            return Ok(None);
        }

        let Instance {
            strategy,
            buffer,
            position,
            ..
        } = &mut *guard;

        // One strategy's panic must never take down the runtime; log and
        // keep the instance alive for the next bar.
        let outcome = catch_unwind(AssertUnwindSafe(|| strategy.on_bar(bar, buffer, position)));
        let signal = match outcome {
            Ok(signal) => signal,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(strategy = %id, panic = %message, "Strategy panicked on bar");
                return Ok(None);
            }
        };

        let Some(signal) = signal else {
            return Ok(None);
        };

        let closes = guard.buffer.closes_tail(lookback);
        let bars = guard.buffer.bars_tail(lookback.max(2));
        Ok(Some(SignalEnvelope {
            strategy_id: id,
            venue: guard.venue.clone(),
            symbol: guard.symbol.clone(),
            signal,
            close: bar.close,
            sigma: sample_std(&closes),
            atr: average_true_range(&bars),
            position: guard.position,
        }))
    }

    /// Spawn the bar worker for one instance.
    ///
    /// The worker consumes the instance's bar subscription, runs `on_bar`
    /// synchronously, and forwards signals to the dispatcher channel.
    pub fn spawn_worker(
        self: &Arc<Self>,
        id: StrategyId,
        mut bars: BarReceiver,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = bars.recv() => event,
                };
                let Some(event) = event else {
                    debug!(strategy = %id, "Bar stream ended");
                    break;
                };

                match event {
                    BarEvent::Bar(bar) => match runtime.process_bar(id, &bar) {
                        Ok(Some(envelope)) => {
                            if runtime.signal_tx.send(envelope).await.is_err() {
                                warn!(strategy = %id, "Dispatcher gone; stopping worker");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(strategy = %id, error = %err, "Bar processing failed");
                            break;
                        }
                    },
                    BarEvent::Heartbeat { last_ts_ms, .. } => {
                        debug!(strategy = %id, ?last_ts_ms, "Stream heartbeat");
                    }
                }
            }
            debug!(strategy = %id, "Strategy worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{OrderSide, EPSILON};
    use crate::testkit::bar_at;
    use serde_json::json;

    fn runtime() -> (Arc<StrategyRuntime>, mpsc::Receiver<SignalEnvelope>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(StrategyRuntime::new(tx)), rx)
    }

    fn breakout(runtime: &StrategyRuntime) -> StrategyId {
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

    #[test]
    fn create_validates_params() {
        let (runtime, _rx) = runtime();
        let err = runtime.create(
            "breakout_reset",
            &json!({"lookback_period": 1}),
            "mock".into(),
            "BTCUSDT".into(),
            Timeframe::M1,
        );
        assert!(matches!(err, Err(Error::InvalidParams(_))));

        assert!(matches!(
            runtime.create(
                "no_such_kind",
                &json!({}),
                "mock".into(),
                "BTCUSDT".into(),
                Timeframe::M1,
            ),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn lifecycle_operations_require_existing_instance() {
        let (runtime, _rx) = runtime();
        let ghost = StrategyId::new();
        assert!(matches!(runtime.start(ghost), Err(Error::NotFound(_))));
        assert!(matches!(runtime.stop(ghost), Err(Error::NotFound(_))));
        assert!(matches!(runtime.position(ghost), Err(Error::NotFound(_))));
    }

    #[test]
    fn warmup_produces_no_signals() {
        let (runtime, _rx) = runtime();
        let id = breakout(&runtime);

        for i in 0..19 {
            let signal = runtime
                .process_bar(id, &bar_at(i * 60_000, 100.0))
                .unwrap();
            assert!(signal.is_none());
        }
    }

    #[test]
    fn breakout_emits_signal_with_context() {
        let (runtime, _rx) = runtime();
        let id = breakout(&runtime);

        for i in 0..20 {
            assert!(runtime
                .process_bar(id, &bar_at(i * 60_000, 100.0))
                .unwrap()
                .is_none());
        }
        let envelope = runtime
            .process_bar(id, &bar_at(21 * 60_000, 110.0))
            .unwrap()
            .expect("breakout should fire");

        assert_eq!(envelope.strategy_id, id);
        assert!(matches!(
            envelope.signal,
            Signal::Enter {
                side: OrderSide::Buy,
                ..
            }
        ));
        assert_eq!(envelope.close, 110.0);
        assert!(envelope.sigma.unwrap() > 0.0);
        assert!(envelope.position.is_flat());
    }

    #[test]
    fn paused_instances_skip_evaluation() {
        let (runtime, _rx) = runtime();
        let id = breakout(&runtime);
        for i in 0..20 {
            runtime.process_bar(id, &bar_at(i * 60_000, 100.0)).unwrap();
        }
        runtime.pause(id).unwrap();
        let signal = runtime
            .process_bar(id, &bar_at(21 * 60_000, 110.0))
            .unwrap();
        assert!(signal.is_none());

        runtime.start(id).unwrap();
        let signal = runtime
            .process_bar(id, &bar_at(22 * 60_000, 110.0))
            .unwrap();
        assert!(signal.is_some());
    }

    #[test]
    fn fills_update_positions() {
        let (runtime, _rx) = runtime();
        let id = breakout(&runtime);

        let position = runtime
            .apply_fill(
                id,
                &Fill {
                    side: OrderSide::Buy,
                    amount: 0.1,
                    price: 50_000.0,
                },
            )
            .unwrap();
        assert!((position.size - 0.1).abs() < EPSILON);

        let position = runtime
            .apply_fill(
                id,
                &Fill {
                    side: OrderSide::Sell,
                    amount: 0.15,
                    price: 51_000.0,
                },
            )
            .unwrap();
        assert!((position.size + 0.05).abs() < EPSILON);
        assert!((position.avg_entry_price - 51_000.0).abs() < EPSILON);
    }

    #[test]
    fn panicking_strategy_is_contained() {
        struct Bomb;
        impl Strategy for Bomb {
            fn kind(&self) -> &'static str {
                "bomb"
            }
            fn lookback(&self) -> usize {
                1
            }
            fn on_bar(&mut self, _: &Bar, _: &BarBuffer, _: &Position) -> Option<Signal> {
                panic!("strategy bug");
            }
        }

        let (runtime, _rx) = runtime();
        let id = StrategyId::new();
        runtime.instances.insert(
            id,
            Arc::new(Mutex::new(Instance {
                id,
                venue: "mock".into(),
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
                strategy: Box::new(Bomb),
                buffer: BarBuffer::new(1),
                position: Position::flat(),
                status: InstanceStatus::Running,
            })),
        );

        // Panic swallowed, instance still usable.
        assert!(runtime
            .process_bar(id, &bar_at(0, 100.0))
            .unwrap()
            .is_none());
        assert!(runtime
            .process_bar(id, &bar_at(60_000, 100.0))
            .unwrap()
            .is_none());
        assert!(runtime.position(id).is_ok());
    }

    #[tokio::test]
    async fn worker_forwards_signals_to_dispatcher() {
        use crate::core::data::BarFanout;

        let (runtime, mut signals) = runtime();
        let id = breakout(&runtime);

        let fanout = BarFanout::new();
        let rx = fanout.subscribe(64);
        let cancel = CancellationToken::new();
        let worker = runtime.spawn_worker(id, rx, cancel.clone());

        for i in 0..20 {
            fanout.publish(&BarEvent::Bar(bar_at(i * 60_000, 100.0)));
        }
        fanout.publish(&BarEvent::Bar(bar_at(21 * 60_000, 110.0)));

        let envelope = signals.recv().await.expect("signal expected");
        assert_eq!(envelope.strategy_id, id);
        assert!(envelope.signal.is_entry());

        cancel.cancel();
        worker.await.unwrap();
    }

    #[test]
    fn instances_snapshot_lists_all() {
        let (runtime, _rx) = runtime();
        let a = breakout(&runtime);
        let b = runtime
            .create(
                "mean_reversion",
                &json!({"entry_z_score": 2.0}),
                "mock".into(),
                "ETHUSDT".into(),
                Timeframe::M5,
            )
            .unwrap();

        let infos = runtime.instances();
        assert_eq!(infos.len(), 2);
        let kinds: Vec<_> = infos.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&"breakout_reset"));
        assert!(kinds.contains(&"mean_reversion"));
        let by_id = |id| infos.iter().find(|i| i.id == id).unwrap();
        assert_eq!(by_id(a).status, InstanceStatus::Running);
        assert_eq!(by_id(b).status, InstanceStatus::Stopped);
    }
}
