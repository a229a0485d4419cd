//! Application layer: configuration, shared state, supervision, control.

pub mod config;
pub mod control;
pub mod state;
pub mod supervisor;

pub use config::Config;
pub use control::{ControlApi, CreateStrategyRequest};
pub use state::{AppState, QuarantinedOrder, RiskLimits};
pub use supervisor::{Engine, Supervisor};
