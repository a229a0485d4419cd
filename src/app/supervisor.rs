//! Engine supervisor.
//!
//! Owns every task lifecycle: builds the component graph, starts the
//! ingestor, then strategies, then the dispatcher and key sweepers, and
//! cascades one cancellation token through all of it. Shutdown guarantees
//! that no new orders are issued and everything in flight ends reconciled
//! or quarantined.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::config::Config;
use crate::app::control::{ControlApi, CreateStrategyRequest};
use crate::app::state::AppState;
use crate::core::data::MarketDataIngestor;
use crate::core::dispatch::OrderDispatcher;
use crate::core::domain::{Symbol, Timeframe};
use crate::core::exchange::create_adapter;
use crate::core::executor::ReliableExecutor;
use crate::core::keys::{
    AuditLog, KeyEvent, KeyManager, KeyStore, KeySweepers, MemoryStore, RedisStore, SecretCipher,
    SystemClock,
};
use crate::core::strategy::StrategyRuntime;
use crate::error::Result;

/// Capacity of the strategy → dispatcher signal channel.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// A running engine.
pub struct Engine {
    control: Arc<ControlApi>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    sweepers: KeySweepers,
    key_event_task: JoinHandle<()>,
}

impl Engine {
    /// The control surface for the external API layer.
    pub fn control(&self) -> Arc<ControlApi> {
        Arc::clone(&self.control)
    }

    /// The root cancellation token (for embedding in a larger runtime).
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop everything: no new orders after this point; in-flight orders are
    /// drained to a reconciled or quarantined state before return.
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        self.cancel.cancel();

        // The dispatcher drains its in-flight submissions before exiting.
        if self.dispatcher.await.is_err() {
            warn!("Dispatcher task ended abnormally");
        }
        for handle in self.control.drain_tasks() {
            let _ = handle.await;
        }
        self.sweepers.join().await;
        let _ = self.key_event_task.await;
        info!("Engine stopped");
    }
}

/// Builds and starts the engine.
pub struct Supervisor;

impl Supervisor {
    /// Start all components per the configuration.
    ///
    /// # Errors
    /// `Error::Config` for invalid configuration, `Error::Store` when the
    /// key store is unreachable (the CLI maps these to exit codes 1 and 2).
    pub async fn start(config: Config) -> Result<Engine> {
        let cancel = CancellationToken::new();

        // Exchange adapter + reliability layer.
        let adapter = create_adapter(
            config.exchange.effective_exchange_id(),
            config.exchange.credentials(),
            config.exchange.use_testnet,
            Duration::from_secs(config.exchange.request_timeout_secs),
            config.exchange.rate_limit_per_minute,
        )?;
        let venue = adapter.venue().clone();
        let executor = Arc::new(ReliableExecutor::new(
            Arc::clone(&adapter),
            config.executor.to_executor_config(),
        ));

        // Key manager: store, sealing, audit.
        let store: Arc<dyn KeyStore> = if config.keys.use_memory_store {
            info!("Using in-memory key store");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedisStore::connect(&config.keys.redis_url()).await?)
        };
        let (enc_key, enc_salt) = config.encryption_material();
        let cipher = SecretCipher::new(&enc_key, &enc_salt)?;
        let audit = Arc::new(AuditLog::open(&config.keys.audit_db)?);
        let keys = Arc::new(KeyManager::new(
            store,
            cipher,
            audit,
            Arc::new(SystemClock),
            config.keys.settings(),
        ));

        // Shared state, runtime, ingestor, control surface.
        let state = Arc::new(AppState::new(config.risk.clone()));
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let runtime = Arc::new(StrategyRuntime::new(signal_tx));
        let ingestor = Arc::new(MarketDataIngestor::new(
            Arc::clone(&adapter),
            config.data.to_ingestor_config(),
        ));
        let control = Arc::new(ControlApi::new(
            Arc::clone(&runtime),
            Arc::clone(&executor),
            Arc::clone(&keys),
            Arc::clone(&state),
            Arc::clone(&ingestor),
            venue.clone(),
            cancel.clone(),
        ));

        // 1. Market-data streams.
        for stream in &config.streams {
            let symbol = Symbol::normalize(&stream.symbol);
            let timeframe = Timeframe::from_str(&stream.timeframe)?;
            control.ensure_stream(&symbol, timeframe);
        }

        // 2. Seeded strategies.
        for seed in &config.strategies {
            let id = control.create_strategy(&CreateStrategyRequest {
                user: "config".into(),
                kind: seed.kind.clone(),
                params: seed.params.clone(),
                venue: venue.as_str().to_string(),
                symbol: seed.symbol.clone(),
                timeframe: seed.timeframe.clone(),
            })?;
            if seed.auto_start {
                control.start_strategy(id)?;
            }
        }

        // 3. Dispatcher.
        let dispatcher = Arc::new(OrderDispatcher::new(
            Arc::clone(&executor),
            Arc::clone(&runtime),
            Arc::clone(&state),
            config.dispatcher_config(),
        ));
        let dispatcher_task = tokio::spawn(dispatcher.run(signal_rx, cancel.child_token()));

        // 4. Key sweepers and rotation-event relay.
        let sweepers = KeySweepers::spawn(
            Arc::clone(&keys),
            config.keys.sweeper(),
            cancel.child_token(),
        );
        let key_event_task = spawn_key_event_relay(Arc::clone(&keys), cancel.child_token());

        info!(
            venue = %venue,
            streams = config.streams.len(),
            strategies = config.strategies.len(),
            "Engine started"
        );
        Ok(Engine {
            control,
            cancel,
            dispatcher: dispatcher_task,
            sweepers,
            key_event_task,
        })
    }
}

/// Surface key lifecycle events in the supervisor's log; rotation events are
/// where credential refreshes for live adapters would hook in.
fn spawn_key_event_relay(keys: Arc<KeyManager>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = keys.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(KeyEvent::Rotated {
                    predecessor,
                    successor,
                    grace_period_ends,
                }) => {
                    info!(
                        %predecessor,
                        %successor,
                        grace_until = %grace_period_ends,
                        "Key rotation in effect; predecessor valid until grace deadline"
                    );
                }
                Ok(KeyEvent::Compromised { key_id }) => {
                    warn!(%key_id, "Key compromised; venue calls with it will fail closed");
                }
                Ok(KeyEvent::ExpiryWarning {
                    key_id, days_left, ..
                }) => {
                    info!(%key_id, days_left, "Key expiry approaching");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Key event relay lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::{KeysConfig, StrategySeed, StreamConfig};
    use serde_json::json;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.keys = KeysConfig {
            use_memory_store: true,
            audit_db: ":memory:".into(),
            ..KeysConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn engine_starts_and_stops_clean() {
        let engine = Supervisor::start(memory_config()).await.unwrap();
        let control = engine.control();
        assert!(control.strategies().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn seeded_strategies_come_up_running() {
        let mut config = memory_config();
        config.streams = vec![StreamConfig {
            symbol: "BTC/USDT".into(),
            timeframe: "1m".into(),
        }];
        config.strategies = vec![StrategySeed {
            kind: "breakout_reset".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "1m".into(),
            params: json!({"lookback_period": 20}),
            auto_start: true,
        }];

        let engine = Supervisor::start(config).await.unwrap();
        let strategies = engine.control().strategies();
        assert_eq!(strategies.len(), 1);
        assert_eq!(
            strategies[0].status,
            crate::core::strategy::InstanceStatus::Running
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn bad_seed_fails_startup() {
        let mut config = memory_config();
        config.strategies = vec![StrategySeed {
            kind: "breakout_reset".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "1m".into(),
            params: json!({"lookback_period": 1}),
            auto_start: true,
        }];

        assert!(Supervisor::start(config).await.is_err());
    }
}
