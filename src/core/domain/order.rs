//! Order requests, venue order status, and fills.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Symbol, Venue};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    #[must_use]
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Sign applied to fill amounts: buys add, sells subtract.
    #[must_use]
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type. The dispatcher only emits market orders; limit orders exist
/// for the manual-order path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

/// An order as submitted by the engine.
///
/// `client_id` is the idempotency key: two submissions carrying the same
/// `client_id` must never create two venue orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub venue: Venue,
    pub symbol: Symbol,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub amount: f64,
    pub price: Option<f64>,
    pub ts_ms: i64,
}

impl OrderRequest {
    /// Build a market order with a fresh `client_id`.
    pub fn market(venue: Venue, symbol: Symbol, side: OrderSide, amount: f64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            venue,
            symbol,
            order_type: OrderType::Market,
            side,
            amount,
            price: None,
            ts_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Build a limit order with a fresh `client_id`.
    pub fn limit(venue: Venue, symbol: Symbol, side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            venue,
            symbol,
            order_type: OrderType::Limit,
            side,
            amount,
            price: Some(price),
            ts_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Venue-reported order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Unknown,
}

impl OrderState {
    /// Terminal states need no further polling.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Pending => "pending",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Canceled => "canceled",
            OrderState::Rejected => "rejected",
            OrderState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Normalized venue order status.
///
/// Venue-specific fields survive only in the opaque `raw` attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub exchange_order_id: String,
    pub state: OrderState,
    pub filled_amount: f64,
    pub avg_fill_price: f64,
    pub fee: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl OrderStatus {
    /// A fill usable for position reconciliation, when one exists.
    #[must_use]
    pub fn fill(&self, side: OrderSide) -> Option<Fill> {
        if self.filled_amount <= 0.0 || self.avg_fill_price <= 0.0 {
            return None;
        }
        Some(Fill {
            side,
            amount: self.filled_amount,
            price: self.avg_fill_price,
        })
    }
}

/// A confirmed execution applied to position state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
}

/// Normalized account balance for one currency.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
}
