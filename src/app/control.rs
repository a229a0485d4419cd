//! In-process control surface.
//!
//! The language-neutral API the external REST façade calls into: strategy
//! lifecycle, manual orders, key management, metrics. Everything here is a
//! thin, validated gateway to the owning component.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::app::state::{AppState, QuarantinedOrder};
use crate::core::data::MarketDataIngestor;
use crate::core::dispatch::RiskGate;
use crate::core::domain::{OrderRequest, OrderStatus, Symbol, Ticker, Timeframe, Venue};
use crate::core::executor::{CircuitState, ReliableExecutor};
use crate::core::keys::{
    ApiKey, CreateKeyRequest, KeyManager, RequestContext,
};
use crate::core::metrics;
use crate::core::strategy::{InstanceInfo, StrategyId, StrategyRuntime};
use crate::error::{Error, Result};

/// Inputs for creating a strategy through the control surface.
#[derive(Debug, Clone)]
pub struct CreateStrategyRequest {
    pub user: String,
    pub kind: String,
    pub params: Value,
    pub venue: String,
    pub symbol: String,
    pub timeframe: String,
}

/// The control API handle. Cheap to clone via `Arc`.
pub struct ControlApi {
    runtime: Arc<StrategyRuntime>,
    executor: Arc<ReliableExecutor>,
    keys: Arc<KeyManager>,
    state: Arc<AppState>,
    ingestor: Arc<MarketDataIngestor>,
    risk: RiskGate,
    venue: Venue,
    cancel: CancellationToken,
    streams: DashMap<(Symbol, Timeframe), ()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<StrategyRuntime>,
        executor: Arc<ReliableExecutor>,
        keys: Arc<KeyManager>,
        state: Arc<AppState>,
        ingestor: Arc<MarketDataIngestor>,
        venue: Venue,
        cancel: CancellationToken,
    ) -> Self {
        let risk = RiskGate::new(Arc::clone(&state));
        Self {
            runtime,
            executor,
            keys,
            state,
            ingestor,
            risk,
            venue,
            cancel,
            streams: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the ingest task for a stream exactly once.
    pub fn ensure_stream(&self, symbol: &Symbol, timeframe: Timeframe) {
        let key = (symbol.clone(), timeframe);
        if self.streams.insert(key, ()).is_none() {
            let handle =
                self.ingestor
                    .spawn(symbol.clone(), timeframe, self.cancel.child_token());
            self.tasks.lock().push(handle);
        }
    }

    /// Create a strategy instance and wire it to its bar stream. The
    /// instance starts stopped; call [`start_strategy`](Self::start_strategy).
    pub fn create_strategy(&self, request: &CreateStrategyRequest) -> Result<StrategyId> {
        let venue = Venue::new(&request.venue);
        if venue != self.venue {
            return Err(Error::InvalidParams(format!(
                "venue {venue} is not served by this engine (venue: {})",
                self.venue
            )));
        }
        let symbol = Symbol::normalize(&request.symbol);
        if symbol.is_empty() {
            return Err(Error::InvalidParams("empty symbol".into()));
        }
        let timeframe = Timeframe::from_str(&request.timeframe)?;

        let id = self
            .runtime
            .create(&request.kind, &request.params, venue, symbol.clone(), timeframe)?;

        self.ensure_stream(&symbol, timeframe);
        let bars = self.ingestor.subscribe(&symbol, timeframe);
        let worker = self
            .runtime
            .spawn_worker(id, bars, self.cancel.child_token());
        self.tasks.lock().push(worker);

        info!(user = %request.user, strategy = %id, kind = %request.kind, "Strategy created via control API");
        Ok(id)
    }

    pub fn start_strategy(&self, id: StrategyId) -> Result<()> {
        self.runtime.start(id)
    }

    pub fn stop_strategy(&self, id: StrategyId) -> Result<()> {
        self.runtime.stop(id)
    }

    pub fn strategies(&self) -> Vec<InstanceInfo> {
        self.runtime.instances()
    }

    /// Submit a manual order through the full reliability stack.
    ///
    /// Risk limits apply the same way they do to strategy entries.
    pub async fn place_manual_order(
        &self,
        user: &str,
        request: OrderRequest,
    ) -> Result<OrderStatus> {
        self.risk.check_entry(&request.symbol, request.amount)?;
        info!(user, client_id = %request.client_id, symbol = %request.symbol, "Manual order");
        let verified = self
            .executor
            .place_order(&request, &self.cancel.child_token())
            .await?;
        Ok(verified.status)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.executor
            .get_ticker(&Symbol::normalize(symbol), &self.cancel.child_token())
            .await
    }

    /// Open orders on the venue, optionally filtered by symbol.
    pub async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderStatus>> {
        let symbol = symbol.map(Symbol::normalize);
        self.executor
            .get_open_orders(symbol.as_ref(), &self.cancel.child_token())
            .await
    }

    // -- key management -----------------------------------------------------

    pub async fn create_key(
        &self,
        request: CreateKeyRequest,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        self.keys.create(request, ctx).await
    }

    pub async fn approve_key(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        self.keys.approve(key_id, caller, is_admin, ctx).await
    }

    pub async fn rotate_key(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        grace_hours: Option<i64>,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        self.keys
            .rotate(key_id, caller, is_admin, grace_hours, ctx)
            .await
    }

    pub async fn revoke_key(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        reason: &str,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        self.keys.revoke(key_id, caller, is_admin, reason, ctx).await
    }

    pub async fn mark_key_compromised(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        details: &str,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        self.keys
            .mark_compromised(key_id, caller, is_admin, details, ctx)
            .await
    }

    pub async fn validate_key(
        &self,
        material: &str,
        ctx: &RequestContext,
    ) -> Result<(bool, Option<ApiKey>)> {
        self.keys.validate(material, ctx).await
    }

    pub async fn expiring_keys(&self, window_days: i64) -> Result<Vec<ApiKey>> {
        self.keys.expiring(window_days, false).await
    }

    pub async fn key_history(&self, user: &str, venue: &str) -> Result<Vec<ApiKey>> {
        self.keys.key_history(user, &Venue::new(venue)).await
    }

    // -- observability ------------------------------------------------------

    /// Orders parked for operator review.
    pub fn quarantined_orders(&self) -> Vec<QuarantinedOrder> {
        self.state.quarantined()
    }

    /// Executor circuit state, for health endpoints.
    pub fn circuit_state(&self) -> CircuitState {
        self.executor.circuit_state()
    }

    /// Prometheus text exposition of all engine metrics.
    pub fn metrics_text(&self) -> String {
        metrics::render()
    }

    /// Take ownership of all spawned worker/ingest task handles.
    pub(crate) fn drain_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}
