//! Tradewind - algorithmic crypto-trading engine core.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── core/             # Reusable engine components
//! │   ├── domain/       # Pure domain types (bars, orders, positions)
//! │   ├── exchange/     # Venue adapters + deterministic mock
//! │   ├── executor/     # Retry, circuit breaker, verification, idempotency
//! │   ├── keys/         # API-key lifecycle, key store, audit trail
//! │   ├── data/         # Kline ingest and bar fan-out
//! │   ├── strategy/     # Strategy contract, reference strategies, runtime
//! │   └── dispatch/     # Sizing, risk gate, order dispatch
//! └── app/              # Configuration, supervisor, control surface
//! ```
//!
//! # Features
//!
//! - `testkit` - Deterministic test doubles for downstream crates

pub mod app;
pub mod cli;
pub mod core;
pub mod error;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
