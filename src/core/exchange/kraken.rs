//! Kraken venue adapter.
//!
//! REST for orders and balances, WebSocket OHLC feed for klines. Private
//! endpoints use Kraken's `API-Sign` scheme: base64 HMAC-SHA512 over the URI
//! path and a SHA-256 digest of the nonce plus the form body.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::domain::{
    Balance, Bar, OrderRequest, OrderState, OrderStatus, OrderType, Symbol, Ticker, Timeframe,
    Venue,
};
use crate::error::{Error, Result};

use super::{cancellable, Credentials, ExchangeAdapter, KlineStream, KlineUpdate};

const REST_URL: &str = "https://api.kraken.com";
const WS_URL: &str = "wss://ws.kraken.com";

/// Quote currencies recognized when splitting a normalized symbol into the
/// slash-separated pair Kraken's WebSocket expects.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "USD", "EUR", "GBP", "XBT", "ETH"];

/// Kraken exchange adapter.
pub struct KrakenAdapter {
    venue: Venue,
    http: HttpClient,
    base_url: String,
    ws_url: String,
    credentials: Option<Credentials>,
}

impl KrakenAdapter {
    pub fn new(credentials: Option<Credentials>, request_timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        info!("Initialized Kraken adapter");
        Ok(Self {
            venue: Venue::new("kraken"),
            http,
            base_url: REST_URL.to_string(),
            ws_url: WS_URL.to_string(),
            credentials,
        })
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| Error::AuthFailed("no API credentials configured".into()))
    }

    /// Compute Kraken's `API-Sign` header for a private call.
    fn sign(&self, path: &str, nonce: i64, body: &str) -> Result<String> {
        let creds = self.credentials()?;
        let secret = BASE64
            .decode(&creds.api_secret)
            .map_err(|e| Error::AuthFailed(format!("bad secret encoding: {e}")))?;

        let mut digest = Sha256::new();
        digest.update(format!("{nonce}{body}").as_bytes());

        let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
            .map_err(|e| Error::AuthFailed(format!("bad secret: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&digest.finalize());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn public(&self, path: &str, query: &str) -> Result<Value> {
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        let response = self.http.get(&url).send().await?;
        let payload: KrakenEnvelope = response.json().await?;
        payload.into_result()
    }

    async fn private(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let creds = self.credentials()?;
        let nonce = Utc::now().timestamp_millis();
        let mut body = format!("nonce={nonce}");
        for (name, value) in params {
            body.push_str(&format!("&{name}={value}"));
        }
        let signature = self.sign(path, nonce, &body)?;

        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("API-Key", creds.api_key.clone())
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let payload: KrakenEnvelope = response.json().await?;
        payload.into_result()
    }

    /// Slash-separated pair for the WebSocket feed (`XBTUSD` → `XBT/USD`).
    fn ws_pair(symbol: &Symbol) -> String {
        let s = symbol.as_str();
        for quote in KNOWN_QUOTES {
            if s.len() > quote.len() && s.ends_with(quote) {
                let base = &s[..s.len() - quote.len()];
                return format!("{base}/{quote}");
            }
        }
        s.to_string()
    }
}

/// Every Kraken REST response carries an error array plus a result payload.
#[derive(Debug, Deserialize)]
struct KrakenEnvelope {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: Option<Value>,
}

impl KrakenEnvelope {
    fn into_result(self) -> Result<Value> {
        if let Some(first) = self.error.first() {
            return Err(map_kraken_error(first));
        }
        self.result
            .ok_or_else(|| Error::Unknown("kraken response without result".into()))
    }
}

/// Kraken errors are strings like `EAPI:Rate limit exceeded`; classify by
/// prefix.
fn map_kraken_error(raw: &str) -> Error {
    let lowered = raw.to_ascii_lowercase();
    if lowered.contains("rate limit") {
        Error::RateLimited { retry_after: None }
    } else if lowered.contains("invalid key")
        || lowered.contains("invalid signature")
        || lowered.contains("permission denied")
        || lowered.contains("invalid nonce")
    {
        Error::AuthFailed(raw.to_string())
    } else if lowered.starts_with("eservice") || lowered.contains("unavailable") {
        Error::Transient(raw.to_string())
    } else if lowered.starts_with("eorder") || lowered.starts_with("egeneral") {
        Error::Permanent(raw.to_string())
    } else {
        Error::Unknown(raw.to_string())
    }
}

fn value_f64(value: &Value, field: &str) -> Result<f64> {
    match value {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| Error::Permanent(format!("unparseable {field}: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::Permanent(format!("unparseable {field}"))),
        _ => Err(Error::Permanent(format!("missing {field}"))),
    }
}

fn map_order_state(raw: &str, filled: f64) -> OrderState {
    match raw {
        "pending" => OrderState::Pending,
        "open" if filled > 0.0 => OrderState::PartiallyFilled,
        "open" => OrderState::Open,
        "closed" => OrderState::Filled,
        "canceled" | "expired" => OrderState::Canceled,
        other => {
            warn!(state = other, "Unmapped Kraken order state");
            OrderState::Unknown
        }
    }
}

fn order_status_from_entry(txid: &str, entry: &Value) -> Result<OrderStatus> {
    let filled = entry
        .get("vol_exec")
        .map(|v| value_f64(v, "vol_exec"))
        .transpose()?
        .unwrap_or(0.0);
    let price = entry
        .get("price")
        .map(|v| value_f64(v, "price"))
        .transpose()?
        .unwrap_or(0.0);
    let fee = entry
        .get("fee")
        .map(|v| value_f64(v, "fee"))
        .transpose()?
        .unwrap_or(0.0);
    let state = entry
        .get("status")
        .and_then(Value::as_str)
        .map_or(OrderState::Unknown, |s| map_order_state(s, filled));

    Ok(OrderStatus {
        exchange_order_id: txid.to_string(),
        state,
        filled_amount: filled,
        avg_fill_price: price,
        fee,
        raw: Some(entry.clone()),
    })
}

#[async_trait]
impl ExchangeAdapter for KrakenAdapter {
    fn venue(&self) -> &Venue {
        &self.venue
    }

    async fn get_ticker(&self, symbol: &Symbol, cancel: &CancellationToken) -> Result<Ticker> {
        cancellable(cancel, async {
            let result = self
                .public("/0/public/Ticker", &format!("pair={symbol}"))
                .await?;
            // The result keys use Kraken's internal pair spelling; take the
            // first (only) entry.
            let entry = result
                .as_object()
                .and_then(|m| m.values().next())
                .ok_or_else(|| Error::Permanent("empty ticker result".into()))?;

            let first_of = |key: &str| -> Result<f64> {
                let arr = entry
                    .get(key)
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::Permanent(format!("ticker missing {key}")))?;
                value_f64(
                    arr.first()
                        .ok_or_else(|| Error::Permanent(format!("ticker empty {key}")))?,
                    key,
                )
            };

            Ok(Ticker {
                symbol: symbol.clone(),
                bid: first_of("b")?,
                ask: first_of("a")?,
                last: first_of("c")?,
                raw: Some(entry.clone()),
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
            let mut params = vec![
                ("pair", request.symbol.to_string()),
                ("type", request.side.as_str().to_string()),
                ("ordertype", request.order_type.as_str().to_string()),
                ("volume", request.amount.to_string()),
                ("userref", (request.client_id.as_u128() as u32).to_string()),
            ];
            if request.order_type == OrderType::Limit {
                let price = request.price.ok_or_else(|| {
                    Error::InvalidParams("limit order without a price".into())
                })?;
                params.push(("price", price.to_string()));
            }

            let result = self.private("/0/private/AddOrder", &params).await?;
            let txid = result
                .get("txid")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Unknown("AddOrder response without txid".into()))?
                .to_string();

            debug!(txid = %txid, symbol = %request.symbol, "Kraken order placed");
            // AddOrder acknowledges placement only; fills come from QueryOrders.
            Ok(OrderStatus {
                exchange_order_id: txid,
                state: OrderState::Open,
                filled_amount: 0.0,
                avg_fill_price: 0.0,
                fee: 0.0,
                raw: Some(result),
            })
        })
        .await
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        cancellable(cancel, async {
            self.private("/0/private/CancelOrder", &[("txid", order_id.to_string())])
                .await?;
            self.get_order_status(order_id, symbol, &CancellationToken::new())
                .await
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
            let result = self
                .private("/0/private/QueryOrders", &[("txid", order_id.to_string())])
                .await?;
            let entry = result
                .get(order_id)
                .ok_or_else(|| Error::NotFound(format!("order {order_id}")))?;
            order_status_from_entry(order_id, entry)
        })
        .await
    }

    async fn get_balance(
        &self,
        currency: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Balance>> {
        cancellable(cancel, async {
            let result = self.private("/0/private/Balance", &[]).await?;
            let map = result
                .as_object()
                .ok_or_else(|| Error::Permanent("balance result not an object".into()))?;

            let mut balances = HashMap::new();
            for (asset, value) in map {
                if let Some(filter) = currency {
                    if !asset.eq_ignore_ascii_case(filter) {
                        continue;
                    }
                }
                let total = value_f64(value, asset)?;
                // Kraken's Balance endpoint reports totals only.
                balances.insert(
                    asset.clone(),
                    Balance {
                        free: total,
                        used: 0.0,
                        total,
                    },
                );
            }
            Ok(balances)
        })
        .await
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&Symbol>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrderStatus>> {
        cancellable(cancel, async {
            let result = self.private("/0/private/OpenOrders", &[]).await?;
            let open = result
                .get("open")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let mut orders = Vec::new();
            for (txid, entry) in &open {
                if let Some(filter) = symbol {
                    let pair = entry
                        .pointer("/descr/pair")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if Symbol::normalize(pair) != *filter {
                        continue;
                    }
                }
                orders.push(order_status_from_entry(txid, entry)?);
            }
            Ok(orders)
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
            info!(url = %self.ws_url, pair = %Self::ws_pair(symbol), "Connecting Kraken OHLC stream");
            let (mut ws, _response) = connect_async(&self.ws_url).await?;

            let subscribe = serde_json::json!({
                "event": "subscribe",
                "pair": [Self::ws_pair(symbol)],
                "subscription": { "name": "ohlc", "interval": timeframe.minutes() },
            });
            ws.send(Message::Text(subscribe.to_string())).await?;

            Ok(Box::new(KrakenKlineStream {
                ws,
                venue: self.venue.clone(),
                symbol: symbol.clone(),
                timeframe,
            }) as Box<dyn KlineStream>)
        })
        .await
    }
}

struct KrakenKlineStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    venue: Venue,
    symbol: Symbol,
    timeframe: Timeframe,
}

/// OHLC data frames are arrays: `[channel_id, [time, etime, open, high,
/// low, close, vwap, volume, count], "ohlc-N", "PAIR"]`. Event objects
/// (heartbeats, subscription acks) are skipped.
fn parse_ohlc_frame(
    venue: &Venue,
    symbol: &Symbol,
    timeframe: Timeframe,
    text: &str,
) -> Result<Option<KlineUpdate>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let Some(frame) = value.as_array() else {
        return Ok(None);
    };
    let Some(fields) = frame.get(1).and_then(Value::as_array) else {
        return Ok(None);
    };
    if fields.len() < 8 {
        return Ok(None);
    }

    let end_time = value_f64(&fields[1], "etime")?;
    let ts_ms = (end_time * 1000.0) as i64 - timeframe.as_millis();

    let bar = Bar {
        venue: venue.clone(),
        symbol: symbol.clone(),
        ts_ms,
        open: value_f64(&fields[2], "open")?,
        high: value_f64(&fields[3], "high")?,
        low: value_f64(&fields[4], "low")?,
        close: value_f64(&fields[5], "close")?,
        volume: value_f64(&fields[7], "volume")?,
        timeframe,
    };
    // Kraken streams in-progress windows; closure is inferred upstream
    // when a later window supersedes this one.
    Ok(Some(KlineUpdate { bar, closed: false }))
}

#[async_trait]
impl KlineStream for KrakenKlineStream {
    async fn next_update(&mut self) -> Option<Result<KlineUpdate>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    match parse_ohlc_frame(&self.venue, &self.symbol, self.timeframe, &text) {
                        Ok(Some(update)) => return Some(Ok(update)),
                        Ok(None) => continue,
                        Err(err) => return Some(Err(err)),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Kraken OHLC stream closed");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }
}
