//! Binance venue adapter.
//!
//! REST for orders, balances and tickers; WebSocket for kline streams.
//! Signed endpoints use the HMAC-SHA256 query signature Binance requires.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::domain::{
    Balance, Bar, OrderRequest, OrderState, OrderStatus, OrderType, Symbol, Ticker, Timeframe,
    Venue,
};
use crate::error::{Error, Result};

use super::{cancellable, Credentials, ExchangeAdapter, KlineStream, KlineUpdate};

const MAINNET_API: &str = "https://api.binance.com";
const TESTNET_API: &str = "https://testnet.binance.vision";
const MAINNET_WS: &str = "wss://stream.binance.com:9443/ws";
const TESTNET_WS: &str = "wss://testnet.binance.vision/ws";

type HmacSha256 = Hmac<Sha256>;

/// Client-side request pacing derived from `RATE_LIMIT_PER_MINUTE`.
struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<tokio::time::Instant>>,
}

impl Throttle {
    fn new(requests_per_minute: u32) -> Option<Self> {
        if requests_per_minute == 0 {
            return None;
        }
        Some(Self {
            min_interval: Duration::from_millis(60_000 / u64::from(requests_per_minute)),
            last: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        let mut last = self.last.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}

/// Binance exchange adapter.
pub struct BinanceAdapter {
    venue: Venue,
    http: HttpClient,
    base_url: String,
    ws_url: String,
    credentials: Option<Credentials>,
    throttle: Option<Throttle>,
}

impl BinanceAdapter {
    /// Create an adapter.
    ///
    /// `requests_per_minute == 0` disables client-side pacing.
    pub fn new(
        credentials: Option<Credentials>,
        testnet: bool,
        request_timeout: Duration,
        requests_per_minute: u32,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let (base_url, ws_url) = if testnet {
            (TESTNET_API.to_string(), TESTNET_WS.to_string())
        } else {
            (MAINNET_API.to_string(), MAINNET_WS.to_string())
        };

        info!(testnet, "Initialized Binance adapter");
        Ok(Self {
            venue: Venue::new("binance"),
            http,
            base_url,
            ws_url,
            credentials,
            throttle: Throttle::new(requests_per_minute),
        })
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| Error::AuthFailed("no API credentials configured".into()))
    }

    /// Append timestamp and HMAC signature to a signed-endpoint query.
    fn sign(&self, mut query: String) -> Result<String> {
        let creds = self.credentials()?;
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));

        let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
            .map_err(|e| Error::AuthFailed(format!("bad secret: {e}")))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{query}&signature={signature}"))
    }

    fn request(&self, method: Method, path: &str, query: &str) -> RequestBuilder {
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        let mut builder = self.http.request(method, url);
        if let Some(creds) = &self.credentials {
            builder = builder.header("X-MBX-APIKEY", creds.api_key.clone());
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        if let Some(throttle) = &self.throttle {
            throttle.pace().await;
        }
        let response = builder.send().await?;
        map_http_error(response).await
    }

    async fn send_signed(&self, method: Method, path: &str, query: String) -> Result<Response> {
        let signed = self.sign(query)?;
        self.send(self.request(method, path, &signed)).await
    }

    fn ws_stream_url(&self, symbol: &Symbol, timeframe: Timeframe) -> String {
        format!(
            "{}/{}@kline_{}",
            self.ws_url,
            symbol.as_str().to_ascii_lowercase(),
            timeframe.as_str()
        )
    }
}

/// Map venue HTTP status codes into the error taxonomy.
async fn map_http_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            Error::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::AuthFailed(format!("{status}: {body}"))
        }
        s if s.is_client_error() => Error::Permanent(format!("{status}: {body}")),
        s if s.is_server_error() => Error::Transient(format!("{status}: {body}")),
        _ => Error::Unknown(format!("{status}: {body}")),
    })
}

fn parse_f64(raw: &str, field: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::Permanent(format!("unparseable {field}: {raw}")))
}

fn map_order_state(raw: &str) -> OrderState {
    match raw {
        "NEW" => OrderState::Open,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "FILLED" => OrderState::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderState::Canceled,
        "REJECTED" => OrderState::Rejected,
        "PENDING_NEW" => OrderState::Pending,
        other => {
            warn!(state = other, "Unmapped Binance order state");
            OrderState::Unknown
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    bid_price: String,
    ask_price: String,
    last_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderFillEntry {
    commission: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    fills: Vec<OrderFillEntry>,
}

impl OrderResponse {
    fn into_status(self) -> Result<OrderStatus> {
        let raw = serde_json::json!({
            "orderId": self.order_id,
            "status": self.status,
        });
        let filled = match &self.executed_qty {
            Some(qty) => parse_f64(qty, "executedQty")?,
            None => 0.0,
        };
        let quote = match &self.cummulative_quote_qty {
            Some(q) => parse_f64(q, "cummulativeQuoteQty")?,
            None => 0.0,
        };
        let avg_fill_price = if filled > 0.0 { quote / filled } else { 0.0 };
        let fee = self
            .fills
            .iter()
            .map(|f| parse_f64(&f.commission, "commission").unwrap_or(0.0))
            .sum();

        Ok(OrderStatus {
            exchange_order_id: self.order_id.to_string(),
            state: map_order_state(&self.status),
            filled_amount: filled,
            avg_fill_price,
            fee,
            raw: Some(raw),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccountBalanceEntry {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AccountBalanceEntry>,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> &Venue {
        &self.venue
    }

    async fn get_ticker(&self, symbol: &Symbol, cancel: &CancellationToken) -> Result<Ticker> {
        cancellable(cancel, async {
            let query = format!("symbol={symbol}");
            let response = self
                .send(self.request(Method::GET, "/api/v3/ticker/24hr", &query))
                .await?;
            let payload: TickerResponse = response.json().await?;
            Ok(Ticker {
                symbol: symbol.clone(),
                bid: parse_f64(&payload.bid_price, "bidPrice")?,
                ask: parse_f64(&payload.ask_price, "askPrice")?,
                last: parse_f64(&payload.last_price, "lastPrice")?,
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
            let mut query = format!(
                "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
                request.symbol,
                request.side.as_str().to_ascii_uppercase(),
                request.order_type.as_str().to_ascii_uppercase(),
                request.amount,
                request.client_id.simple(),
            );
            if request.order_type == OrderType::Limit {
                let price = request.price.ok_or_else(|| {
                    Error::InvalidParams("limit order without a price".into())
                })?;
                query.push_str(&format!("&price={price}&timeInForce=GTC"));
            }

            let response = self.send_signed(Method::POST, "/api/v3/order", query).await?;
            let payload: OrderResponse = response.json().await?;
            debug!(order_id = payload.order_id, symbol = %request.symbol, "Binance order placed");
            payload.into_status()
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
            let query = format!("symbol={symbol}&orderId={order_id}");
            let response = self
                .send_signed(Method::DELETE, "/api/v3/order", query)
                .await?;
            let payload: OrderResponse = response.json().await?;
            payload.into_status()
        })
        .await
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        cancellable(cancel, async {
            let query = format!("symbol={symbol}&orderId={order_id}");
            let response = self.send_signed(Method::GET, "/api/v3/order", query).await?;
            let payload: OrderResponse = response.json().await?;
            payload.into_status()
        })
        .await
    }

    async fn get_balance(
        &self,
        currency: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Balance>> {
        cancellable(cancel, async {
            let response = self
                .send_signed(Method::GET, "/api/v3/account", String::new())
                .await?;
            let payload: AccountResponse = response.json().await?;

            let mut balances = HashMap::new();
            for entry in payload.balances {
                if let Some(filter) = currency {
                    if !entry.asset.eq_ignore_ascii_case(filter) {
                        continue;
                    }
                }
                let free = parse_f64(&entry.free, "free")?;
                let used = parse_f64(&entry.locked, "locked")?;
                balances.insert(
                    entry.asset,
                    Balance {
                        free,
                        used,
                        total: free + used,
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
            let query = symbol.map_or(String::new(), |s| format!("symbol={s}"));
            let response = self
                .send_signed(Method::GET, "/api/v3/openOrders", query)
                .await?;
            let payload: Vec<OrderResponse> = response.json().await?;
            payload.into_iter().map(OrderResponse::into_status).collect()
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
            let url = self.ws_stream_url(symbol, timeframe);
            info!(url = %url, "Connecting Binance kline stream");
            let (ws, response) = connect_async(&url).await?;
            debug!(status = %response.status(), "Kline stream connected");
            Ok(Box::new(BinanceKlineStream {
                ws,
                venue: self.venue.clone(),
                symbol: symbol.clone(),
                timeframe,
            }) as Box<dyn KlineStream>)
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

struct BinanceKlineStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    venue: Venue,
    symbol: Symbol,
    timeframe: Timeframe,
}

impl BinanceKlineStream {
    fn parse_update(&self, text: &str) -> Result<Option<KlineUpdate>> {
        // Non-kline frames (subscription acks, pings) are skipped.
        let Ok(event) = serde_json::from_str::<KlineEvent>(text) else {
            return Ok(None);
        };
        let k = event.kline;
        let bar = Bar {
            venue: self.venue.clone(),
            symbol: self.symbol.clone(),
            ts_ms: k.open_time,
            open: parse_f64(&k.open, "open")?,
            high: parse_f64(&k.high, "high")?,
            low: parse_f64(&k.low, "low")?,
            close: parse_f64(&k.close, "close")?,
            volume: parse_f64(&k.volume, "volume")?,
            timeframe: self.timeframe,
        };
        Ok(Some(KlineUpdate {
            bar,
            closed: k.closed,
        }))
    }
}

#[async_trait]
impl KlineStream for BinanceKlineStream {
    async fn next_update(&mut self) -> Option<Result<KlineUpdate>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match self.parse_update(&text) {
                    Ok(Some(update)) => return Some(Ok(update)),
                    Ok(None) => continue,
                    Err(err) => return Some(Err(err)),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Binance kline stream closed");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }
}
