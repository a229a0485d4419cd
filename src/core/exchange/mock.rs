//! Deterministic mock venue.
//!
//! Fills are synchronous and reproducible, failures and latency are
//! injectable, and kline feeds are driven by a test-owned handle. The mock
//! is a first-class adapter (selected with `EXCHANGE_ID=mock`), not a
//! test-only shim, so dry runs exercise the exact production pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::domain::{
    Balance, Bar, OrderRequest, OrderState, OrderStatus, OrderType, Symbol, Ticker, Timeframe,
    Venue,
};
use crate::error::{Error, Result};

use super::{cancellable, ExchangeAdapter, KlineStream, KlineUpdate};

/// Default seed price for symbols nobody has set yet.
const DEFAULT_LAST_PRICE: f64 = 30_000.0;

/// Taker fee fraction applied to mock fills.
const MOCK_FEE_RATE: f64 = 0.001;

/// How mock orders reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    /// Orders fill completely on placement.
    FillImmediately,
    /// Orders sit `open` for N status polls, then fill.
    FillAfterPolls(u32),
    /// Orders fill a fraction on placement and never progress further.
    PartialFill { fraction: f64 },
    /// Orders never leave `open`; verification gives up.
    NeverFill,
}

#[derive(Debug, Clone)]
struct StoredOrder {
    status: OrderStatus,
    symbol: Symbol,
    amount: f64,
    price: f64,
    polls_until_fill: Option<u32>,
}

struct MockState {
    last_price: HashMap<Symbol, f64>,
    orders: HashMap<String, StoredOrder>,
    balances: HashMap<String, Balance>,
    forced_errors: VecDeque<Error>,
    rate_limited: bool,
    latency: Duration,
    behavior: MockBehavior,
}

struct Feed {
    queue: Mutex<VecDeque<Result<KlineUpdate>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Feed {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }
}

/// Test-side control handle for a mock kline feed.
#[derive(Clone)]
pub struct MockKlineHandle {
    feed: Arc<Feed>,
}

impl MockKlineHandle {
    /// Push a closed bar into the feed.
    pub fn push_bar(&self, bar: Bar) {
        self.push(KlineUpdate { bar, closed: true });
    }

    /// Push an arbitrary update (open or closed).
    pub fn push(&self, update: KlineUpdate) {
        self.feed.queue.lock().push_back(Ok(update));
        self.feed.notify.notify_waiters();
    }

    /// Push a stream error (the ingestor will reconnect).
    pub fn push_error(&self, error: Error) {
        self.feed.queue.lock().push_back(Err(error));
        self.feed.notify.notify_waiters();
    }

    /// End the feed; readers see `None`.
    pub fn close(&self) {
        self.feed.closed.store(true, Ordering::SeqCst);
        self.feed.notify.notify_waiters();
    }
}

struct MockStream {
    feed: Arc<Feed>,
}

#[async_trait]
impl KlineStream for MockStream {
    async fn next_update(&mut self) -> Option<Result<KlineUpdate>> {
        loop {
            // Register before checking so a push racing the await is not lost.
            let notified = self.feed.notify.notified();
            if let Some(update) = self.feed.queue.lock().pop_front() {
                return Some(update);
            }
            if self.feed.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

/// Deterministic in-memory venue.
pub struct MockAdapter {
    venue: Venue,
    state: Mutex<MockState>,
    feeds: Mutex<HashMap<(Symbol, Timeframe), Arc<Feed>>>,
    order_seq: AtomicU64,
    place_order_calls: AtomicU64,
}

impl MockAdapter {
    pub fn new() -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            "BTC".to_string(),
            Balance {
                free: 1.0,
                used: 0.0,
                total: 1.0,
            },
        );
        balances.insert(
            "USDT".to_string(),
            Balance {
                free: 10_000.0,
                used: 0.0,
                total: 10_000.0,
            },
        );
        balances.insert(
            "ETH".to_string(),
            Balance {
                free: 10.0,
                used: 0.0,
                total: 10.0,
            },
        );

        Self {
            venue: Venue::new("mock"),
            state: Mutex::new(MockState {
                last_price: HashMap::new(),
                orders: HashMap::new(),
                balances,
                forced_errors: VecDeque::new(),
                rate_limited: false,
                latency: Duration::ZERO,
                behavior: MockBehavior::FillImmediately,
            }),
            feeds: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(0),
            place_order_calls: AtomicU64::new(0),
        }
    }

    /// Seed the last trade price for a symbol.
    pub fn set_last_price(&self, symbol: &Symbol, price: f64) {
        self.state.lock().last_price.insert(symbol.clone(), price);
    }

    /// Replace the account balance for a currency.
    pub fn set_balance(&self, currency: &str, balance: Balance) {
        self.state
            .lock()
            .balances
            .insert(currency.to_string(), balance);
    }

    /// Queue an error; the next operation pops and returns it.
    pub fn force_error(&self, error: Error) {
        self.state.lock().forced_errors.push_back(error);
    }

    /// Queue the same error N times.
    pub fn force_errors(&self, error: Error, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.forced_errors.push_back(error.clone());
        }
    }

    /// Make every operation fail with `RateLimited` until cleared.
    pub fn set_rate_limited(&self, limited: bool) {
        self.state.lock().rate_limited = limited;
    }

    /// Add artificial latency before every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Configure how orders fill.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// How many times `place_order` reached the venue.
    pub fn place_order_calls(&self) -> u64 {
        self.place_order_calls.load(Ordering::SeqCst)
    }

    /// Control handle for the kline feed of (symbol, timeframe).
    ///
    /// Streams returned by `subscribe_klines` read from the same feed, so a
    /// handle obtained before or after subscription drives the same queue.
    pub fn kline_handle(&self, symbol: &Symbol, timeframe: Timeframe) -> MockKlineHandle {
        let feed = self
            .feeds
            .lock()
            .entry((symbol.clone(), timeframe))
            .or_insert_with(|| Arc::new(Feed::new()))
            .clone();
        MockKlineHandle { feed }
    }

    /// Pop a forced failure or rate-limit, plus the configured latency.
    async fn gate(&self) -> Result<()> {
        let (latency, injected) = {
            let mut state = self.state.lock();
            let injected = if state.rate_limited {
                Some(Error::RateLimited { retry_after: None })
            } else {
                state.forced_errors.pop_front()
            };
            (state.latency, injected)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_order_id(&self) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("mock-{seq}")
    }

    fn quote_price(state: &mut MockState, symbol: &Symbol) -> f64 {
        *state
            .last_price
            .entry(symbol.clone())
            .or_insert(DEFAULT_LAST_PRICE)
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    fn venue(&self) -> &Venue {
        &self.venue
    }

    async fn get_ticker(&self, symbol: &Symbol, cancel: &CancellationToken) -> Result<Ticker> {
        cancellable(cancel, async {
            self.gate().await?;
            let mut state = self.state.lock();
            let last = Self::quote_price(&mut state, symbol);
            Ok(Ticker {
                symbol: symbol.clone(),
                bid: last * 0.999,
                ask: last * 1.001,
                last,
                raw: None,
            })
        })
        .await
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        cancellable(cancel, async {
            self.gate().await?;
            self.place_order_calls.fetch_add(1, Ordering::SeqCst);

            let mut state = self.state.lock();
            let last = Self::quote_price(&mut state, &request.symbol);
            let price = match request.order_type {
                OrderType::Market => last,
                OrderType::Limit => request.price.unwrap_or(last),
            };

            let order_id = self.next_order_id();
            let behavior = state.behavior;
            let (order_state, filled, avg, polls) = match behavior {
                MockBehavior::FillImmediately => {
                    (OrderState::Filled, request.amount, price, None)
                }
                MockBehavior::FillAfterPolls(n) => (OrderState::Open, 0.0, 0.0, Some(n)),
                MockBehavior::PartialFill { fraction } => {
                    let filled = request.amount * fraction.clamp(0.0, 1.0);
                    (OrderState::PartiallyFilled, filled, price, None)
                }
                MockBehavior::NeverFill => (OrderState::Open, 0.0, 0.0, None),
            };

            let status = OrderStatus {
                exchange_order_id: order_id.clone(),
                state: order_state,
                filled_amount: filled,
                avg_fill_price: avg,
                fee: filled * avg * MOCK_FEE_RATE,
                raw: None,
            };
            state.orders.insert(
                order_id.clone(),
                StoredOrder {
                    status: status.clone(),
                    symbol: request.symbol.clone(),
                    amount: request.amount,
                    price,
                    polls_until_fill: polls,
                },
            );
            debug!(order_id = %order_id, symbol = %request.symbol, side = %request.side, "Mock order placed");
            Ok(status)
        })
        .await
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        cancellable(cancel, async {
            self.gate().await?;
            let mut state = self.state.lock();
            let stored = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| Error::NotFound(format!("order {order_id}")))?;
            if stored.status.state.is_terminal() {
                return Err(Error::BadState(format!(
                    "order {order_id} already {}",
                    stored.status.state
                )));
            }
            stored.status.state = OrderState::Canceled;
            Ok(stored.status.clone())
        })
        .await
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        cancellable(cancel, async {
            self.gate().await?;
            let mut state = self.state.lock();
            let stored = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| Error::NotFound(format!("order {order_id}")))?;

            if let Some(polls) = stored.polls_until_fill {
                if polls == 0 {
                    stored.status.state = OrderState::Filled;
                    stored.status.filled_amount = stored.amount;
                    stored.status.avg_fill_price = stored.price;
                    stored.status.fee = stored.amount * stored.price * MOCK_FEE_RATE;
                    stored.polls_until_fill = None;
                } else {
                    stored.polls_until_fill = Some(polls - 1);
                }
            }
            Ok(stored.status.clone())
        })
        .await
    }

    async fn get_balance(
        &self,
        currency: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Balance>> {
        cancellable(cancel, async {
            self.gate().await?;
            let state = self.state.lock();
            match currency {
                Some(c) => {
                    let balance = state.balances.get(c).copied().unwrap_or_default();
                    Ok(HashMap::from([(c.to_string(), balance)]))
                }
                None => Ok(state.balances.clone()),
            }
        })
        .await
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&Symbol>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrderStatus>> {
        cancellable(cancel, async {
            self.gate().await?;
            let state = self.state.lock();
            Ok(state
                .orders
                .values()
                .filter(|o| !o.status.state.is_terminal())
                .filter(|o| symbol.map_or(true, |s| &o.symbol == s))
                .map(|o| o.status.clone())
                .collect())
        })
        .await
    }

    async fn subscribe_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn KlineStream>> {
        cancellable(cancel, async {
            self.gate().await?;
            let feed = self.kline_handle(symbol, timeframe).feed;
            Ok(Box::new(MockStream { feed }) as Box<dyn KlineStream>)
        })
        .await
    }
}
