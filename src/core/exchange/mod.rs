//! Exchange adapter layer.
//!
//! [`ExchangeAdapter`] is the single venue-agnostic capability set the rest
//! of the engine programs against. Per-venue clients (Binance, Kraken) and
//! the deterministic mock are interchangeable behind it.
//!
//! Contracts:
//! - every operation observes the caller's cancellation token and returns
//!   [`Error::Cancelled`] without committing further side effects;
//! - `place_order` is *not* idempotent here; idempotency lives in the
//!   reliable executor, keyed by `client_id`;
//! - venue errors are mapped into the crate taxonomy (`Transient`,
//!   `RateLimited`, `AuthFailed`, `Permanent`).

mod binance;
mod factory;
mod kraken;
mod mock;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::domain::{Balance, Bar, OrderRequest, OrderStatus, Symbol, Ticker, Timeframe, Venue};
use crate::error::{Error, Result};

pub use binance::BinanceAdapter;
pub use factory::create_adapter;
pub use kraken::KrakenAdapter;
pub use mock::{MockAdapter, MockBehavior, MockKlineHandle};

/// API credentials for a venue, fetched through the key manager.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// One kline event from a venue stream.
///
/// `closed` is true when the venue marked the window complete. Venues that
/// never flag closure (continuous updates) set it false; the ingestor then
/// finalizes a bar when its timestamp is superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub bar: Bar,
    pub closed: bool,
}

/// A live kline subscription.
///
/// `next_update` returns `None` when the stream is finished and
/// `Some(Err(_))` on a broken connection; the ingestor owns reconnection.
#[async_trait]
pub trait KlineStream: Send {
    async fn next_update(&mut self) -> Option<Result<KlineUpdate>>;
}

/// Venue-agnostic exchange capability set.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// The venue this adapter talks to.
    fn venue(&self) -> &Venue;

    /// Fetch the current ticker for a symbol.
    async fn get_ticker(&self, symbol: &Symbol, cancel: &CancellationToken) -> Result<Ticker>;

    /// Submit an order. Not idempotent at this layer.
    async fn place_order(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus>;

    /// Cancel an open order.
    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus>;

    /// Fetch the current status of an order.
    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus>;

    /// Fetch balances, optionally restricted to one currency.
    async fn get_balance(
        &self,
        currency: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Balance>>;

    /// Fetch open orders, optionally restricted to one symbol.
    async fn get_open_orders(
        &self,
        symbol: Option<&Symbol>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrderStatus>>;

    /// Open a kline subscription for (symbol, timeframe).
    async fn subscribe_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn KlineStream>>;
}

/// Race a future against cancellation.
///
/// Returns [`Error::Cancelled`] the moment the token trips; whatever the
/// in-flight HTTP call already committed on the venue stands.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellable_passes_through_results() {
        let token = CancellationToken::new();
        let result = cancellable(&token, async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancellable_returns_cancelled_on_tripped_token() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = cancellable(&token, async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancellable_interrupts_pending_future() {
        let token = CancellationToken::new();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            cancellable(&child, async {
                std::future::pending::<Result<()>>().await
            })
            .await
        });
        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
