//! Position state and fill reconciliation.
//!
//! A position is a signed size plus an average entry price. The invariant
//! `size == 0 ⇔ avg_entry_price == 0` holds after every mutation; sizes with
//! `|size| < EPSILON` are treated as flat.

use serde::{Deserialize, Serialize};

use super::order::{Fill, OrderSide};

/// Flat tolerance for floating-point position sizes.
pub const EPSILON: f64 = 1e-9;

/// Per-strategy position state.
///
/// Positive size is long, negative is short. Mutated only through
/// [`Position::apply_fill`] on confirmed fills.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub size: f64,
    pub avg_entry_price: f64,
}

impl Position {
    /// A flat position.
    #[must_use]
    pub fn flat() -> Self {
        Self::default()
    }

    /// True when the position is flat within tolerance.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.size.abs() < EPSILON
    }

    /// True for a long position.
    #[must_use]
    pub fn is_long(&self) -> bool {
        self.size > EPSILON
    }

    /// True for a short position.
    #[must_use]
    pub fn is_short(&self) -> bool {
        self.size < -EPSILON
    }

    /// Signed fractional P&L of the position at `price`, relative to entry.
    ///
    /// Positive means the position is in profit. Returns `None` when flat.
    #[must_use]
    pub fn pnl_pct(&self, price: f64) -> Option<f64> {
        if self.is_flat() || self.avg_entry_price <= 0.0 {
            return None;
        }
        let change = (price - self.avg_entry_price) / self.avg_entry_price;
        Some(if self.is_long() { change } else { -change })
    }

    /// Apply a confirmed fill.
    ///
    /// Covers open, increase, reduce, flatten and flip. Zero-amount or
    /// zero-price fills are ignored.
    pub fn apply_fill(&mut self, fill: &Fill) {
        if fill.amount <= 0.0 || fill.price <= 0.0 {
            return;
        }

        let signed = fill.side.sign() * fill.amount;
        let new_size = self.size + signed;

        if new_size.abs() < EPSILON {
            // Flattened.
            self.size = 0.0;
            self.avg_entry_price = 0.0;
            return;
        }

        let same_direction = self.size * signed >= 0.0;
        if self.is_flat() {
            // Opening from flat.
            self.size = new_size;
            self.avg_entry_price = fill.price;
        } else if same_direction {
            // Increasing: volume-weighted average entry.
            let old_value = self.size.abs() * self.avg_entry_price;
            let new_value = fill.amount * fill.price;
            self.avg_entry_price = (old_value + new_value) / new_size.abs();
            self.size = new_size;
        } else if fill.amount >= self.size.abs() {
            // Flipping: the overshoot is a fresh entry at the fill price.
            self.size = new_size;
            self.avg_entry_price = fill.price;
        } else {
            // Reducing: entry price unchanged.
            self.size = new_size;
        }
    }
}
