//! API-key lifecycle management.
//!
//! The key manager owns per-(user, venue) exchange credentials stored in a
//! Redis-shaped key-value store, with material sealed at rest, a relational
//! audit trail, and background sweepers for expiration, expiry notifications
//! and automatic rotation.

mod audit;
mod crypto;
mod manager;
mod record;
mod store;
mod sweeper;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::domain::Venue;

pub use audit::{mask_details, AuditEntry, AuditLog, AuditRow, Severity};
pub use crypto::{generate_material, mask_secret, material_hash, SecretCipher};
pub use manager::{CreateKeyRequest, KeyManager, KeySettings, RequestContext};
pub use record::{ApiKey, KeyStatus, RotationMetadata};
pub use store::{KeyStore, MemoryStore, RedisStore};
pub use sweeper::{KeySweepers, SweeperConfig};

/// Time source for the key lifecycle.
///
/// Production uses [`SystemClock`]; tests drive expiry and grace deadlines
/// with a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lifecycle events broadcast to the supervisor and notification consumers.
#[derive(Debug, Clone)]
pub enum KeyEvent {
    Created {
        key_id: Uuid,
        user_id: String,
        venue: Venue,
    },
    Rotated {
        predecessor: Uuid,
        successor: Uuid,
        grace_period_ends: DateTime<Utc>,
    },
    Revoked {
        key_id: Uuid,
    },
    Compromised {
        key_id: Uuid,
    },
    Expired {
        key_id: Uuid,
    },
    /// A key is approaching expiry; emitted by the notification sweeper at
    /// the configured day buckets.
    ExpiryWarning {
        key_id: Uuid,
        user_id: String,
        days_left: i64,
    },
}
