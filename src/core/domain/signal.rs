//! Trading signals emitted by strategies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// Why a strategy wants out of its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Reversion,
    Duration,
    Drawdown,
}

impl ExitReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "tp",
            ExitReason::StopLoss => "sl",
            ExitReason::Reversion => "reversion",
            ExitReason::Duration => "duration",
            ExitReason::Drawdown => "drawdown",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A strategy's verdict for one bar. `None` (no signal) is expressed as
/// `Option::<Signal>::None` by `on_bar`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Open a position in the given direction. `size_hint` lets a strategy
    /// suggest an amount; the dispatcher's sizing rules have the final say.
    Enter {
        side: OrderSide,
        size_hint: Option<f64>,
    },
    /// Close the entire position.
    Exit { reason: ExitReason },
}

impl Signal {
    /// Convenience constructor for an entry without a size hint.
    #[must_use]
    pub fn enter(side: OrderSide) -> Self {
        Signal::Enter {
            side,
            size_hint: None,
        }
    }

    /// Convenience constructor for an exit.
    #[must_use]
    pub fn exit(reason: ExitReason) -> Self {
        Signal::Exit { reason }
    }

    /// True for entry signals.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        matches!(self, Signal::Enter { .. })
    }
}
