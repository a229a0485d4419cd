//! Adapter construction by venue name.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};

use super::{BinanceAdapter, Credentials, ExchangeAdapter, KrakenAdapter, MockAdapter};

/// Create the adapter for `exchange_id`.
///
/// Supported ids: `binance`, `kraken`, `mock`. `requests_per_minute == 0`
/// disables client-side pacing where the venue supports it.
pub fn create_adapter(
    exchange_id: &str,
    credentials: Option<Credentials>,
    testnet: bool,
    request_timeout: Duration,
    requests_per_minute: u32,
) -> Result<Arc<dyn ExchangeAdapter>> {
    let id = exchange_id.trim().to_ascii_lowercase();
    info!(exchange = %id, testnet, "Creating exchange adapter");

    match id.as_str() {
        "binance" => Ok(Arc::new(BinanceAdapter::new(
            credentials,
            testnet,
            request_timeout,
            requests_per_minute,
        )?)),
        "kraken" => Ok(Arc::new(KrakenAdapter::new(credentials, request_timeout)?)),
        "mock" => Ok(Arc::new(MockAdapter::new())),
        other => Err(Error::Config(format!("unsupported exchange: {other}"))),
    }
}
