//! Key-manager configuration: store connection, encryption, rotation policy.

use std::time::Duration;

use serde::Deserialize;

use crate::core::keys::{KeySettings, SweeperConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Use the in-memory store instead of Redis (tests and dry runs).
    pub use_memory_store: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u8,
    pub redis_password: Option<String>,
    /// Platform secret the sealing key is derived from.
    pub encryption_key: String,
    pub encryption_salt: String,
    pub default_expiry_days: i64,
    pub rotation_grace_hours: i64,
    pub auto_rotation_enabled: bool,
    pub auto_rotation_threshold_days: i64,
    pub notification_days: Vec<i64>,
    pub key_length: usize,
    /// Validation passes when the store is down. Test configs only.
    pub fail_open: bool,
    /// Sqlite database for the audit trail.
    pub audit_db: String,
    pub expiration_check_secs: u64,
    pub notification_check_secs: u64,
    pub auto_rotation_check_secs: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            use_memory_store: false,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_password: None,
            encryption_key: String::new(),
            encryption_salt: String::new(),
            default_expiry_days: 90,
            rotation_grace_hours: 24,
            auto_rotation_enabled: true,
            auto_rotation_threshold_days: 7,
            notification_days: vec![30, 14, 7, 3, 1],
            key_length: 40,
            fail_open: false,
            audit_db: "tradewind-audit.db".to_string(),
            expiration_check_secs: 3600,
            notification_check_secs: 86_400,
            auto_rotation_check_secs: 86_400,
        }
    }
}

impl KeysConfig {
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.is_empty() || self.encryption_salt.is_empty() {
            return Err(Error::Config(
                "ENCRYPTION_KEY and ENCRYPTION_SALT must be set".into(),
            ));
        }
        if self.default_expiry_days <= 0 || self.rotation_grace_hours <= 0 {
            return Err(Error::Config(
                "key expiry and grace period must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Redis connection URL.
    #[must_use]
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{password}@{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
            _ => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    #[must_use]
    pub fn settings(&self) -> KeySettings {
        KeySettings {
            default_expiry_days: self.default_expiry_days,
            grace_period_hours: self.rotation_grace_hours,
            key_length: self.key_length,
            fail_open: self.fail_open,
            auto_rotation_enabled: self.auto_rotation_enabled,
            auto_rotation_threshold_days: self.auto_rotation_threshold_days,
            notification_days: self.notification_days.clone(),
        }
    }

    #[must_use]
    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            expiration_interval: Duration::from_secs(self.expiration_check_secs),
            notification_interval: Duration::from_secs(self.notification_check_secs),
            auto_rotation_interval: Duration::from_secs(self.auto_rotation_check_secs),
        }
    }

    pub(super) fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("REDIS_HOST") {
            if !v.is_empty() {
                self.redis_host = v;
            }
        }
        if let Some(v) = super::env_parse::<u16>("REDIS_PORT") {
            self.redis_port = v;
        }
        if let Some(v) = super::env_parse::<u8>("REDIS_DB") {
            self.redis_db = v;
        }
        if let Ok(v) = std::env::var("REDIS_PASSWORD") {
            if !v.is_empty() {
                self.redis_password = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ENCRYPTION_KEY") {
            if !v.is_empty() {
                self.encryption_key = v;
            }
        }
        if let Ok(v) = std::env::var("ENCRYPTION_SALT") {
            if !v.is_empty() {
                self.encryption_salt = v;
            }
        }
        if let Some(v) = super::env_parse::<i64>("API_KEY_DEFAULT_EXPIRY_DAYS") {
            self.default_expiry_days = v;
        }
        if let Some(v) = super::env_parse::<i64>("API_KEY_ROTATION_GRACE_PERIOD_HOURS") {
            self.rotation_grace_hours = v;
        }
        if let Some(v) = super::env_bool("API_KEY_AUTO_ROTATION_ENABLED") {
            self.auto_rotation_enabled = v;
        }
    }
}
