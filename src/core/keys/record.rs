//! API key records and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::Venue;

/// Lifecycle state of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Awaiting approval before first use.
    Pending,
    /// The current key for its (user, venue).
    Active,
    /// Rotated out; still valid until its grace deadline.
    Rotating,
    /// Past expiry or grace deadline.
    Expired,
    /// Manually revoked.
    Revoked,
    /// Reported compromised. Terminal.
    Compromised,
    /// Temporarily suspended by an operator.
    Suspended,
}

impl KeyStatus {
    /// States that can never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeyStatus::Revoked | KeyStatus::Compromised)
    }

    /// States that participate in validation (subject to expiry checks).
    #[must_use]
    pub fn can_validate(&self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Rotating)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Expired => "expired",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Compromised => "compromised",
            KeyStatus::Suspended => "suspended",
        }
    }
}

/// Rotation bookkeeping carried by a `Rotating` predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationMetadata {
    pub rotated_at: DateTime<Utc>,
    pub grace_period_ends: DateTime<Utc>,
    pub successor_id: Uuid,
}

/// One API key record, as stored (material sealed) and as handled in memory
/// (material plaintext between store codec and caller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: Uuid,
    pub user_id: String,
    pub venue: Venue,
    /// Opaque secret. Encrypted at rest by the store codec; masked whenever
    /// it leaves the key manager in histories or audit details.
    pub material: String,
    pub status: KeyStatus,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub ip_restrictions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key_id: Option<Uuid>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_ip: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ApiKey {
    /// Whether the key is usable at `now`, considering status, expiry and,
    /// for rotating keys, the grace deadline.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if !self.status.can_validate() {
            return false;
        }
        if now >= self.expires_at {
            return false;
        }
        if self.status == KeyStatus::Rotating {
            match &self.rotation {
                Some(meta) => now < meta.grace_period_ends,
                None => false,
            }
        } else {
            true
        }
    }

    /// Whether `client_ip` passes this key's IP restrictions.
    #[must_use]
    pub fn ip_allowed(&self, client_ip: Option<&str>) -> bool {
        if self.ip_restrictions.is_empty() {
            return true;
        }
        match client_ip {
            Some(ip) => self.ip_restrictions.iter().any(|allowed| allowed == ip),
            None => false,
        }
    }
}
