//! Application configuration.
//!
//! Loaded from a TOML file, then overridden by the environment variables the
//! platform recognizes (`USE_REAL_EXCHANGE`, `EXCHANGE_ID`, `REDIS_*`,
//! `ENCRYPTION_*`, `API_KEY_*`, ...). Secrets never live in the TOML file.

mod exchange;
mod keys;
mod logging;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::app::state::RiskLimits;
use crate::core::data::{IngestorConfig, ReconnectConfig};
use crate::core::dispatch::{DispatcherConfig, SizingConfig};
use crate::core::domain::Timeframe;
use crate::core::executor::{CircuitBreakerConfig, ExecutorConfig};
use crate::error::{Error, Result};

pub use exchange::ExchangeConfig;
pub use keys::KeysConfig;
pub use logging::LoggingConfig;

/// One market-data stream to ingest.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub symbol: String,
    pub timeframe: String,
}

/// A strategy instance to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySeed {
    pub kind: String,
    pub symbol: String,
    pub timeframe: String,
    #[serde(default = "default_params")]
    pub params: Value,
    /// Start running immediately (otherwise created stopped).
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

/// Retry / circuit-breaker / verification tuning (serde-friendly mirror of
/// the executor's config).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub verify_polls: u32,
    pub verify_interval_ms: u64,
    pub dedup_ttl_secs: u64,
    pub circuit_window: usize,
    pub circuit_min_samples: usize,
    pub circuit_error_rate: f64,
    pub circuit_open_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            verify_polls: 5,
            verify_interval_ms: 200,
            dedup_ttl_secs: 300,
            circuit_window: 100,
            circuit_min_samples: 10,
            circuit_error_rate: 0.5,
            circuit_open_timeout_secs: 60,
        }
    }
}

impl ExecutorSettings {
    #[must_use]
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            verify_max_polls: self.verify_polls,
            verify_interval: Duration::from_millis(self.verify_interval_ms),
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            circuit: CircuitBreakerConfig {
                window_capacity: self.circuit_window,
                min_samples: self.circuit_min_samples,
                error_rate_threshold: self.circuit_error_rate,
                open_timeout: Duration::from_secs(self.circuit_open_timeout_secs),
            },
        }
    }
}

/// Market-data ingest tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub stale_multiplier: u32,
    pub subscriber_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: f64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            stale_multiplier: 3,
            subscriber_capacity: 256,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
        }
    }
}

impl DataSettings {
    #[must_use]
    pub fn to_ingestor_config(&self) -> IngestorConfig {
        IngestorConfig {
            stale_multiplier: self.stale_multiplier,
            subscriber_capacity: self.subscriber_capacity,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                multiplier: self.reconnect_multiplier,
            },
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub keys: KeysConfig,
    pub risk: RiskLimits,
    pub sizing: SizingConfig,
    pub executor: ExecutorSettings,
    pub data: DataSettings,
    pub logging: LoggingConfig,
    pub streams: Vec<StreamConfig>,
    pub strategies: Vec<StrategySeed>,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file exists.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.exchange.apply_env();
        self.keys.apply_env();
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<()> {
        self.sizing
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        // Key-store encryption material is only mandatory on the redis path;
        // the in-memory store still seals, with whatever was provided.
        if !self.keys.use_memory_store {
            self.keys.validate()?;
        }
        if self.exchange.use_real_exchange && self.exchange.credentials().is_none() {
            return Err(Error::Config(
                "real exchange enabled but API_KEY/API_SECRET are missing".into(),
            ));
        }
        for stream in &self.streams {
            Timeframe::from_str(&stream.timeframe)
                .map_err(|e| Error::Config(format!("stream {}: {e}", stream.symbol)))?;
        }
        for seed in &self.strategies {
            Timeframe::from_str(&seed.timeframe)
                .map_err(|e| Error::Config(format!("strategy {}: {e}", seed.kind)))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            sizing: self.sizing.clone(),
            quote_currency: self.exchange.quote_currency.clone(),
        }
    }

    /// Encryption material for the key manager, defaulted for memory-store
    /// runs so dry runs work without environment setup.
    #[must_use]
    pub fn encryption_material(&self) -> (String, String) {
        let key = if self.keys.encryption_key.is_empty() {
            "tradewind-dev-key".to_string()
        } else {
            self.keys.encryption_key.clone()
        };
        let salt = if self.keys.encryption_salt.is_empty() {
            "tradewind-dev-salt".to_string()
        } else {
            self.keys.encryption_salt.clone()
        };
        (key, salt)
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}
