//! Market-data ingest: venue kline streams in, ordered bar events out.

mod fanout;
mod ingestor;

use serde::{Deserialize, Serialize};

use crate::core::domain::{Bar, Symbol, Timeframe, Venue};

pub use fanout::{BarFanout, BarReceiver};
pub use ingestor::{IngestorConfig, MarketDataIngestor, ReconnectConfig};

/// What subscribers receive from the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BarEvent {
    /// A finalized bar, delivered in `ts_ms` order per stream.
    Bar(Bar),
    /// No bar arrived within the stale timeout.
    Heartbeat {
        venue: Venue,
        symbol: Symbol,
        timeframe: Timeframe,
        /// Timestamp of the last bar emitted on this stream, if any.
        last_ts_ms: Option<i64>,
    },
}

impl BarEvent {
    /// The bar, when this event carries one.
    #[must_use]
    pub fn as_bar(&self) -> Option<&Bar> {
        match self {
            BarEvent::Bar(bar) => Some(bar),
            BarEvent::Heartbeat { .. } => None,
        }
    }
}
