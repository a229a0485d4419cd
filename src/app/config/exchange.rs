//! Exchange connection configuration.

use serde::Deserialize;

use crate::core::exchange::Credentials;

/// Which venue to trade and how to reach it.
///
/// `USE_REAL_EXCHANGE=false` forces the deterministic mock regardless of
/// `exchange_id`, so a misconfigured environment cannot reach a live venue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub use_real_exchange: bool,
    pub exchange_id: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub use_testnet: bool,
    /// Default timeout for venue REST calls, in seconds.
    pub request_timeout_secs: u64,
    /// Client-side REST pacing; 0 disables.
    pub rate_limit_per_minute: u32,
    /// Quote currency for balances, equity and sizing.
    pub quote_currency: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            use_real_exchange: false,
            exchange_id: "mock".to_string(),
            api_key: None,
            api_secret: None,
            use_testnet: false,
            request_timeout_secs: 5,
            rate_limit_per_minute: 1200,
            quote_currency: "USDT".to_string(),
        }
    }
}

impl ExchangeConfig {
    /// The adapter id actually used: the mock unless real trading is
    /// explicitly enabled.
    #[must_use]
    pub fn effective_exchange_id(&self) -> &str {
        if self.use_real_exchange {
            &self.exchange_id
        } else {
            "mock"
        }
    }

    /// Static credentials from configuration, when both halves are present.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials {
                    api_key: key.clone(),
                    api_secret: secret.clone(),
                })
            }
            _ => None,
        }
    }

    pub(super) fn apply_env(&mut self) {
        if let Some(v) = super::env_bool("USE_REAL_EXCHANGE") {
            self.use_real_exchange = v;
        }
        if let Ok(v) = std::env::var("EXCHANGE_ID") {
            if !v.is_empty() {
                self.exchange_id = v;
            }
        }
        if let Ok(v) = std::env::var("API_KEY") {
            if !v.is_empty() {
                self.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("API_SECRET") {
            if !v.is_empty() {
                self.api_secret = Some(v);
            }
        }
        if let Some(v) = super::env_bool("USE_TESTNET") {
            self.use_testnet = v;
        }
        if let Some(v) = super::env_parse::<u32>("RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_unless_real_trading_enabled() {
        let config = ExchangeConfig {
            exchange_id: "binance".into(),
            ..ExchangeConfig::default()
        };
        assert_eq!(config.effective_exchange_id(), "mock");

        let live = ExchangeConfig {
            use_real_exchange: true,
            exchange_id: "binance".into(),
            ..ExchangeConfig::default()
        };
        assert_eq!(live.effective_exchange_id(), "binance");
    }

    #[test]
    fn credentials_require_both_halves() {
        let mut config = ExchangeConfig::default();
        assert!(config.credentials().is_none());

        config.api_key = Some("k".into());
        assert!(config.credentials().is_none());

        config.api_secret = Some("s".into());
        let creds = config.credentials().unwrap();
        assert_eq!(creds.api_key, "k");
        assert_eq!(creds.api_secret, "s");
    }
}
