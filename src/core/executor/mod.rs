//! Reliable order execution.
//!
//! Wraps an [`ExchangeAdapter`] with the three guarantees every order path
//! gets: retry with exponential backoff on transient failures, a circuit
//! breaker over a rolling outcome window, and post-submit execution
//! verification. Duplicate submissions (same `client_id`) are answered from
//! the idempotency cache without touching the venue.

mod circuit;
mod idempotency;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::domain::{
    Fill, OrderRequest, OrderState, OrderStatus, Symbol, Ticker, Balance,
};
use crate::core::exchange::ExchangeAdapter;
use crate::core::metrics;
use crate::error::{Error, Result};

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use idempotency::{Claim, IdempotencyCache};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries after the first attempt for `Transient`/`RateLimited` failures.
    pub max_retries: u32,
    /// Backoff base; attempt N sleeps `base_delay × N`.
    pub base_delay: Duration,
    /// Status polls during execution verification.
    pub verify_max_polls: u32,
    /// Delay between verification polls.
    pub verify_interval: Duration,
    /// How long completed outcomes answer duplicate submissions.
    pub dedup_ttl: Duration,
    pub circuit: CircuitBreakerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            verify_max_polls: 5,
            verify_interval: Duration::from_millis(200),
            dedup_ttl: Duration::from_secs(300),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Outcome of a submission after verification.
///
/// `verified` is false when the venue never confirmed a terminal or stable
/// state within the poll budget; such orders are excluded from position
/// updates and parked for operator review.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedOrder {
    pub status: OrderStatus,
    pub verified: bool,
}

impl VerifiedOrder {
    /// The confirmed fill, if verification produced one.
    #[must_use]
    pub fn confirmed_fill(&self, request: &OrderRequest) -> Option<Fill> {
        if !self.verified {
            return None;
        }
        self.status.fill(request.side)
    }
}

/// Reliability wrapper around one exchange adapter.
pub struct ReliableExecutor {
    adapter: Arc<dyn ExchangeAdapter>,
    circuit: CircuitBreaker,
    dedup: IdempotencyCache<VerifiedOrder>,
    config: ExecutorConfig,
}

impl ReliableExecutor {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, config: ExecutorConfig) -> Self {
        Self {
            adapter,
            circuit: CircuitBreaker::new(config.circuit.clone()),
            dedup: IdempotencyCache::new(config.dedup_ttl),
            config,
        }
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.adapter
    }

    /// Current breaker state, for health reporting.
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Submit an order with retry, breaker, verification and idempotency.
    ///
    /// Duplicate `client_id`s (concurrent or within the dedup TTL) receive
    /// the original outcome; the venue sees at most one submission.
    pub async fn place_order(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifiedOrder> {
        match self.dedup.begin(request.client_id) {
            Claim::Follower(rx) => {
                metrics::EXECUTOR
                    .dedup_hits
                    .with_label_values(&[request.symbol.as_str()])
                    .inc();
                debug!(client_id = %request.client_id, "Duplicate submission answered from cache");
                IdempotencyCache::await_outcome(rx).await
            }
            Claim::Owner(guard) => {
                let outcome = self.submit_and_verify(request, cancel).await;
                let shared = guard.complete(outcome);
                match &*shared {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(e.clone()),
                }
            }
        }
    }

    async fn submit_and_verify(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifiedOrder> {
        let labels = [request.symbol.as_str(), request.side.as_str()];
        metrics::EXECUTOR.order_attempts.with_label_values(&labels).inc();
        let started = tokio::time::Instant::now();

        let placed = self
            .with_retry(cancel, || self.adapter.place_order(request, cancel))
            .await;

        let placed = match placed {
            Ok(status) => status,
            Err(err) => {
                metrics::EXECUTOR.order_failures.with_label_values(&labels).inc();
                return Err(err);
            }
        };

        let verified = self.verify_execution(request, placed, cancel).await?;
        metrics::EXECUTOR.order_success.with_label_values(&labels).inc();
        metrics::EXECUTOR
            .order_latency
            .with_label_values(&[request.symbol.as_str()])
            .observe(started.elapsed().as_secs_f64());
        Ok(verified)
    }

    /// Re-poll order status until it is terminal or a partial fill
    /// stabilizes (same filled amount on two consecutive polls).
    async fn verify_execution(
        &self,
        request: &OrderRequest,
        placed: OrderStatus,
        cancel: &CancellationToken,
    ) -> Result<VerifiedOrder> {
        if placed.state.is_terminal() {
            return Ok(VerifiedOrder {
                status: placed,
                verified: true,
            });
        }

        let mut last = placed;
        let mut prev_filled: Option<f64> = None;

        for poll in 0..self.config.verify_max_polls {
            self.sleep(self.config.verify_interval, cancel).await?;

            match self
                .adapter
                .get_order_status(&last.exchange_order_id, &request.symbol, cancel)
                .await
            {
                Ok(status) => {
                    self.circuit.record_success();
                    if status.state.is_terminal() {
                        return Ok(VerifiedOrder {
                            status,
                            verified: true,
                        });
                    }
                    if status.state == OrderState::PartiallyFilled
                        && prev_filled == Some(status.filled_amount)
                    {
                        debug!(
                            order_id = %status.exchange_order_id,
                            filled = status.filled_amount,
                            "Partial fill stabilized"
                        );
                        return Ok(VerifiedOrder {
                            status,
                            verified: true,
                        });
                    }
                    prev_filled = Some(status.filled_amount);
                    last = status;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    self.circuit.record_failure();
                    warn!(poll, error = %err, "Verification poll failed");
                }
            }
        }

        warn!(
            order_id = %last.exchange_order_id,
            state = %last.state,
            "Order unverified after poll budget; flagging for reconciliation"
        );
        last.state = OrderState::Unknown;
        Ok(VerifiedOrder {
            status: last,
            verified: false,
        })
    }

    /// Fetch the current ticker through retry and the breaker.
    pub async fn get_ticker(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<Ticker> {
        self.with_retry(cancel, || self.adapter.get_ticker(symbol, cancel))
            .await
    }

    /// Fetch balances through retry and the breaker.
    pub async fn get_balance(
        &self,
        currency: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Balance>> {
        self.with_retry(cancel, || self.adapter.get_balance(currency, cancel))
            .await
    }

    /// Fetch an order's status through retry and the breaker.
    pub async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        self.with_retry(cancel, || {
            self.adapter.get_order_status(order_id, symbol, cancel)
        })
        .await
    }

    /// Fetch open orders through retry and the breaker.
    pub async fn get_open_orders(
        &self,
        symbol: Option<&Symbol>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrderStatus>> {
        self.with_retry(cancel, || self.adapter.get_open_orders(symbol, cancel))
            .await
    }

    /// Cancel an order through retry and the breaker.
    pub async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        self.with_retry(cancel, || {
            self.adapter.cancel_order(order_id, symbol, cancel)
        })
        .await
    }

    /// Retry loop shared by every venue call.
    ///
    /// Retries `Transient` and `RateLimited` up to `max_retries`, sleeping
    /// `base_delay × attempt` (or the venue's retry-after hint, whichever is
    /// larger). `Permanent`, `AuthFailed` and `Cancelled` fail fast; an open
    /// circuit fails fast without calling the venue at all.
    async fn with_retry<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.circuit.check()?;

            match op().await {
                Ok(value) => {
                    self.circuit.record_success();
                    return Ok(value);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    self.circuit.record_failure();
                    if !err.is_retryable() {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(attempts = attempt, error = %err, "Giving up after retries");
                        return Err(err);
                    }

                    let backoff = self.config.base_delay * attempt;
                    let delay = err.retry_after().map_or(backoff, |hint| hint.max(backoff));
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    self.sleep(delay, cancel).await?;
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
