//! Reusable engine components.

pub mod data;
pub mod dispatch;
pub mod domain;
pub mod exchange;
pub mod executor;
pub mod keys;
pub mod metrics;
pub mod strategy;
