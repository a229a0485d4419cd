//! API-key lifecycle manager.
//!
//! Owns key records in the shared key-value store, the relational audit
//! trail, and the rotation/expiry state machine. All mutations take a
//! per-key lock, write a backup snapshot first, and commit the new record
//! last, so an interrupted operation leaves the previous record intact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::domain::Venue;
use crate::error::{Error, Result};

use super::audit::{AuditEntry, AuditLog, Severity};
use super::crypto::{generate_material, material_hash, mask_secret, SecretCipher};
use super::record::{ApiKey, KeyStatus, RotationMetadata};
use super::store::KeyStore;
use super::{Clock, KeyEvent};

const KEY_PREFIX: &str = "api_key:";
const HASH_PREFIX: &str = "api_key_hash:";
const USER_KEYS_PREFIX: &str = "user_keys:";
const VENUE_KEYS_PREFIX: &str = "venue_keys:";
const VERSION_PREFIX: &str = "key_version:";
const BACKUP_PREFIX: &str = "backup:";
const EXPIRING_INDEX: &str = "expiring_keys";
const ROTATING_INDEX: &str = "rotating_keys";

/// Retention for pre-mutation backup snapshots.
const BACKUP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Key-manager policy knobs.
#[derive(Debug, Clone)]
pub struct KeySettings {
    /// Default lifetime for new keys, in days.
    pub default_expiry_days: i64,
    /// Default grace window for rotations, in hours.
    pub grace_period_hours: i64,
    /// Hex payload length of generated material.
    pub key_length: usize,
    /// Validate successfully when the store is down (test configs only).
    pub fail_open: bool,
    pub auto_rotation_enabled: bool,
    /// Keys expiring within this many days are auto-rotated.
    pub auto_rotation_threshold_days: i64,
    /// Days-to-expiry buckets that trigger a notification event.
    pub notification_days: Vec<i64>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            default_expiry_days: 90,
            grace_period_hours: 24,
            key_length: 40,
            fail_open: false,
            auto_rotation_enabled: true,
            auto_rotation_threshold_days: 7,
            notification_days: vec![30, 14, 7, 3, 1],
        }
    }
}

/// Request metadata attached to key operations for auditing and IP checks.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Inputs for creating a key.
#[derive(Debug, Clone)]
pub struct CreateKeyRequest {
    pub user_id: String,
    pub venue: Venue,
    pub description: String,
    pub permissions: Vec<String>,
    pub expiry_days: Option<i64>,
    pub require_approval: bool,
    pub ip_restrictions: Vec<String>,
}

/// The manager. Cheap to clone behind an `Arc`.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    cipher: SecretCipher,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: KeySettings,
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<KeyEvent>,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        cipher: SecretCipher,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: KeySettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            cipher,
            audit,
            clock,
            settings,
            locks: DashMap::new(),
            events,
        }
    }

    /// Subscribe to lifecycle events (rotation, compromise, expiry).
    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &KeySettings {
        &self.settings
    }

    /// Current time from the manager's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn emit_expiry_warning(&self, key: &ApiKey, days_left: i64) {
        self.emit(KeyEvent::ExpiryWarning {
            key_id: key.key_id,
            user_id: key.user_id.clone(),
            days_left,
        });
    }

    /// Probe the backing store.
    pub async fn ping_store(&self) -> Result<()> {
        self.store.ping().await
    }

    // -- record plumbing ----------------------------------------------------

    fn record_key(key_id: Uuid) -> String {
        format!("{KEY_PREFIX}{key_id}")
    }

    fn key_lock(&self, key_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn write_record(&self, key: &ApiKey) -> Result<()> {
        let mut sealed = key.clone();
        sealed.material = self.cipher.seal(&key.material)?;
        let payload = serde_json::to_string(&sealed)
            .map_err(|e| Error::Store(format!("encode key record: {e}")))?;
        self.store.set(&Self::record_key(key.key_id), &payload).await
    }

    async fn load_record(&self, key_id: Uuid) -> Result<Option<ApiKey>> {
        let Some(payload) = self.store.get(&Self::record_key(key_id)).await? else {
            return Ok(None);
        };
        let mut key: ApiKey = serde_json::from_str(&payload)
            .map_err(|e| Error::Store(format!("decode key record: {e}")))?;
        key.material = self.cipher.open(&key.material)?;
        Ok(Some(key))
    }

    async fn require_record(&self, key_id: Uuid) -> Result<ApiKey> {
        self.load_record(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("key {key_id}")))
    }

    /// Snapshot the current record before mutating it, so operators can roll
    /// back corruption.
    async fn backup_record(&self, key_id: Uuid) -> Result<()> {
        let record_key = Self::record_key(key_id);
        if let Some(payload) = self.store.get(&record_key).await? {
            self.store
                .set_ex(&format!("{BACKUP_PREFIX}{record_key}"), &payload, BACKUP_TTL)
                .await?;
        }
        Ok(())
    }

    fn version_hash(user_id: &str, venue: &Venue) -> String {
        format!("{VERSION_PREFIX}{venue}:{user_id}")
    }

    fn emit(&self, event: KeyEvent) {
        // No subscribers is fine; send only fails then.
        let _ = self.events.send(event);
    }

    // -- operations ---------------------------------------------------------

    /// Create a new key. At most one `active` key may exist per
    /// (user, venue); a second create fails with `BadState`.
    pub async fn create(
        &self,
        request: CreateKeyRequest,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        let now = self.clock.now();

        // A pending key may coexist with an active one; the conflict check
        // re-runs at approval time.
        if !request.require_approval {
            let existing = self
                .user_keys(&request.user_id, false)
                .await?
                .into_iter()
                .find(|k| k.venue == request.venue && k.status == KeyStatus::Active);
            if let Some(existing) = existing {
                return Err(Error::BadState(format!(
                    "user {} already has active key {} for {}",
                    request.user_id, existing.key_id, request.venue
                )));
            }
        }

        let expiry_days = request
            .expiry_days
            .unwrap_or(self.settings.default_expiry_days);
        if expiry_days <= 0 {
            return Err(Error::InvalidParams("expiry_days must be positive".into()));
        }

        let key = ApiKey {
            key_id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            venue: request.venue.clone(),
            material: generate_material(self.settings.key_length),
            status: if request.require_approval {
                KeyStatus::Pending
            } else {
                KeyStatus::Active
            },
            version: 1,
            created_at: now,
            expires_at: now + TimeDelta::days(expiry_days),
            permissions: if request.permissions.is_empty() {
                vec!["read".into(), "trade".into()]
            } else {
                request.permissions.clone()
            },
            ip_restrictions: request.ip_restrictions.clone(),
            rotation: None,
            previous_key_id: None,
            usage_count: 0,
            last_used_at: None,
            last_used_ip: None,
            description: request.description.clone(),
        };

        let lock = self.key_lock(key.key_id);
        let _guard = lock.lock().await;

        self.write_record(&key).await?;
        self.index_key(&key).await?;

        self.audit.record(
            &AuditEntry::key_op(
                &key.user_id,
                "api_key_create",
                key.key_id.to_string(),
                json!({
                    "venue": key.venue.as_str(),
                    "description": key.description.clone(),
                    "permissions": key.permissions.clone(),
                    "expiry_days": expiry_days,
                    "require_approval": request.require_approval,
                }),
            )
            .with_ip(ctx.client_ip.clone()),
        )?;

        info!(key_id = %key.key_id, user = %key.user_id, venue = %key.venue, "API key created");
        self.emit(KeyEvent::Created {
            key_id: key.key_id,
            user_id: key.user_id.clone(),
            venue: key.venue.clone(),
        });
        Ok(key)
    }

    async fn index_key(&self, key: &ApiKey) -> Result<()> {
        let key_id = key.key_id.to_string();
        self.store
            .sadd(&format!("{USER_KEYS_PREFIX}{}", key.user_id), &key_id)
            .await?;
        self.store
            .sadd(&format!("{VENUE_KEYS_PREFIX}{}", key.venue), &key_id)
            .await?;
        self.store
            .zadd(
                EXPIRING_INDEX,
                &key_id,
                key.expires_at.timestamp() as f64,
            )
            .await?;
        self.store
            .hset(
                &Self::version_hash(&key.user_id, &key.venue),
                &key.version.to_string(),
                &key_id,
            )
            .await?;
        self.store
            .set(
                &format!("{HASH_PREFIX}{}", material_hash(&key.material)),
                &key_id,
            )
            .await?;
        Ok(())
    }

    /// Approve a `pending` key, making it the active key for its
    /// (user, venue). Requires the admin capability.
    pub async fn approve(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        if !is_admin {
            return Err(Error::Unauthorized(format!(
                "{caller} cannot approve keys"
            )));
        }

        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let mut key = self.require_record(key_id).await?;
        if key.status != KeyStatus::Pending {
            return Err(Error::BadState(format!(
                "cannot approve key in status {}",
                key.status.as_str()
            )));
        }
        if let Some(active) = self.active_key(&key.user_id, &key.venue).await? {
            return Err(Error::BadState(format!(
                "user {} already has active key {} for {}",
                key.user_id, active.key_id, key.venue
            )));
        }

        self.backup_record(key_id).await?;
        key.status = KeyStatus::Active;
        self.write_record(&key).await?;

        self.audit.record(
            &AuditEntry::key_op(
                caller,
                "api_key_approve",
                key_id.to_string(),
                json!({ "venue": key.venue.as_str(), "key_owner": key.user_id.clone() }),
            )
            .with_ip(ctx.client_ip.clone()),
        )?;

        info!(key_id = %key_id, approver = caller, "API key approved");
        Ok(key)
    }

    /// Rotate a key: a successor becomes `active` immediately and the
    /// predecessor stays valid as `rotating` until the grace deadline.
    pub async fn rotate(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        grace_hours: Option<i64>,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let mut predecessor = self.require_record(key_id).await?;
        if predecessor.user_id != caller && !is_admin {
            return Err(Error::Unauthorized(format!(
                "{caller} cannot rotate key {key_id}"
            )));
        }
        if predecessor.status != KeyStatus::Active {
            return Err(Error::BadState(format!(
                "cannot rotate key in status {}",
                predecessor.status.as_str()
            )));
        }

        let now = self.clock.now();
        let grace_hours = grace_hours.unwrap_or(self.settings.grace_period_hours);
        if grace_hours <= 0 {
            return Err(Error::InvalidParams("grace_hours must be positive".into()));
        }
        let grace_period_ends = now + TimeDelta::hours(grace_hours);

        let successor = ApiKey {
            key_id: Uuid::new_v4(),
            user_id: predecessor.user_id.clone(),
            venue: predecessor.venue.clone(),
            material: generate_material(self.settings.key_length),
            status: KeyStatus::Active,
            version: predecessor.version + 1,
            created_at: now,
            // Rotation does not extend the credential's lifetime.
            expires_at: predecessor.expires_at,
            permissions: predecessor.permissions.clone(),
            ip_restrictions: predecessor.ip_restrictions.clone(),
            rotation: None,
            previous_key_id: Some(predecessor.key_id),
            usage_count: 0,
            last_used_at: None,
            last_used_ip: None,
            description: predecessor.description.clone(),
        };

        self.backup_record(key_id).await?;

        predecessor.status = KeyStatus::Rotating;
        predecessor.rotation = Some(RotationMetadata {
            rotated_at: now,
            grace_period_ends,
            successor_id: successor.key_id,
        });

        self.write_record(&successor).await?;
        self.index_key(&successor).await?;
        self.write_record(&predecessor).await?;
        self.store
            .zadd(
                ROTATING_INDEX,
                &predecessor.key_id.to_string(),
                grace_period_ends.timestamp() as f64,
            )
            .await?;

        self.audit.record(
            &AuditEntry::key_op(
                caller,
                "api_key_rotate",
                key_id.to_string(),
                json!({
                    "successor_id": successor.key_id.to_string(),
                    "grace_hours": grace_hours,
                    "venue": successor.venue.as_str(),
                    "version": successor.version,
                }),
            )
            .with_ip(ctx.client_ip.clone()),
        )?;

        info!(
            predecessor = %predecessor.key_id,
            successor = %successor.key_id,
            grace_until = %grace_period_ends,
            "API key rotated"
        );
        self.emit(KeyEvent::Rotated {
            predecessor: predecessor.key_id,
            successor: successor.key_id,
            grace_period_ends,
        });
        Ok(successor)
    }

    /// Revoke a key immediately. Caller must own the key or hold the admin
    /// capability.
    pub async fn revoke(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        reason: &str,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let mut key = self.require_record(key_id).await?;
        if key.user_id != caller && !is_admin {
            return Err(Error::Unauthorized(format!(
                "{caller} cannot revoke key {key_id}"
            )));
        }
        if key.status.is_terminal() {
            return Err(Error::BadState(format!(
                "key already {}",
                key.status.as_str()
            )));
        }

        self.backup_record(key_id).await?;
        key.status = KeyStatus::Revoked;
        self.write_record(&key).await?;

        self.audit.record(
            &AuditEntry::key_op(
                caller,
                "api_key_revoke",
                key_id.to_string(),
                json!({
                    "reason": reason,
                    "venue": key.venue.as_str(),
                    "key_owner": key.user_id.clone(),
                }),
            )
            .with_severity(Severity::High)
            .with_ip(ctx.client_ip.clone()),
        )?;

        warn!(key_id = %key_id, reason, "API key revoked");
        self.emit(KeyEvent::Revoked { key_id });
        Ok(key)
    }

    /// Mark a key compromised: terminal, critical-severity.
    pub async fn mark_compromised(
        &self,
        key_id: Uuid,
        caller: &str,
        is_admin: bool,
        details: &str,
        ctx: &RequestContext,
    ) -> Result<ApiKey> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let mut key = self.require_record(key_id).await?;
        if key.user_id != caller && !is_admin {
            return Err(Error::Unauthorized(format!(
                "{caller} cannot mark key {key_id} compromised"
            )));
        }
        if key.status == KeyStatus::Compromised {
            return Err(Error::BadState("key already compromised".into()));
        }

        self.backup_record(key_id).await?;
        key.status = KeyStatus::Compromised;
        self.write_record(&key).await?;

        self.audit.record(
            &AuditEntry::key_op(
                caller,
                "api_key_compromised",
                key_id.to_string(),
                json!({
                    "details": details,
                    "venue": key.venue.as_str(),
                    "key_owner": key.user_id.clone(),
                    "material": key.material.clone(),
                }),
            )
            .with_severity(Severity::Critical)
            .with_ip(ctx.client_ip.clone()),
        )?;

        warn!(key_id = %key_id, "API key marked compromised");
        self.emit(KeyEvent::Compromised { key_id });
        Ok(key)
    }

    /// Validate presented material.
    ///
    /// Returns `(valid, record)`. The record is returned even for invalid
    /// keys when one exists, so callers can distinguish unknown material
    /// from a dead key. Store failures fail closed unless `fail_open` is
    /// configured.
    pub async fn validate(
        &self,
        material: &str,
        ctx: &RequestContext,
    ) -> Result<(bool, Option<ApiKey>)> {
        let lookup = self
            .store
            .get(&format!("{HASH_PREFIX}{}", material_hash(material)))
            .await;

        let key_id = match lookup {
            Ok(Some(id)) => match id.parse::<Uuid>() {
                Ok(parsed) => parsed,
                Err(_) => return Ok((false, None)),
            },
            Ok(None) => {
                debug!(ip = ?ctx.client_ip, "Validation failed: unknown material");
                return Ok((false, None));
            }
            Err(err) => {
                if self.settings.fail_open {
                    warn!(error = %err, "Key store down; failing open");
                    return Ok((true, None));
                }
                warn!(error = %err, "Key store down; failing closed");
                return Err(err);
            }
        };

        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let Some(mut key) = self.load_record(key_id).await? else {
            return Ok((false, None));
        };
        // The hash index is append-only; confirm the material still matches.
        if key.material != material {
            return Ok((false, None));
        }

        let now = self.clock.now();
        if !key.is_valid_at(now) {
            return Ok((false, Some(key)));
        }

        if !key.ip_allowed(ctx.client_ip.as_deref()) {
            self.audit.record(
                &AuditEntry::key_op(
                    &key.user_id,
                    "api_key_unauthorized_ip",
                    key.key_id.to_string(),
                    json!({
                        "ip": ctx.client_ip.clone(),
                        "allowed": key.ip_restrictions.clone(),
                    }),
                )
                .with_severity(Severity::High)
                .with_ip(ctx.client_ip.clone())
                .failed(),
            )?;
            warn!(key_id = %key.key_id, ip = ?ctx.client_ip, "Key used from unauthorized IP");
            return Ok((false, Some(key)));
        }

        key.usage_count += 1;
        key.last_used_at = Some(now);
        key.last_used_ip = ctx.client_ip.clone();
        self.write_record(&key).await?;

        Ok((true, Some(key)))
    }

    /// Fetch one key.
    pub async fn get(&self, key_id: Uuid) -> Result<ApiKey> {
        self.require_record(key_id).await
    }

    /// All keys for a user, newest first.
    pub async fn user_keys(&self, user_id: &str, include_expired: bool) -> Result<Vec<ApiKey>> {
        self.collect_keys(&format!("{USER_KEYS_PREFIX}{user_id}"), include_expired)
            .await
    }

    /// All keys for a venue, newest first.
    pub async fn venue_keys(&self, venue: &Venue, include_expired: bool) -> Result<Vec<ApiKey>> {
        self.collect_keys(&format!("{VENUE_KEYS_PREFIX}{venue}"), include_expired)
            .await
    }

    async fn collect_keys(&self, index: &str, include_expired: bool) -> Result<Vec<ApiKey>> {
        let ids = self.store.smembers(index).await?;
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(key_id) = id.parse::<Uuid>() else {
                continue;
            };
            if let Some(key) = self.load_record(key_id).await? {
                if !include_expired && key.status == KeyStatus::Expired {
                    continue;
                }
                keys.push(key);
            }
        }
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    /// The current active key for (user, venue), if any.
    pub async fn active_key(&self, user_id: &str, venue: &Venue) -> Result<Option<ApiKey>> {
        Ok(self
            .user_keys(user_id, false)
            .await?
            .into_iter()
            .find(|k| &k.venue == venue && k.status == KeyStatus::Active))
    }

    /// Keys whose `expires_at` falls within the next `window_days`.
    pub async fn expiring(&self, window_days: i64, include_rotating: bool) -> Result<Vec<ApiKey>> {
        let now = self.clock.now();
        let threshold = (now + TimeDelta::days(window_days)).timestamp() as f64;
        let ids = self
            .store
            .zrange_by_score(EXPIRING_INDEX, 0.0, threshold)
            .await?;

        let mut keys = Vec::new();
        for id in ids {
            let Ok(key_id) = id.parse::<Uuid>() else {
                continue;
            };
            if let Some(key) = self.load_record(key_id).await? {
                let wanted = key.status == KeyStatus::Active
                    || (include_rotating && key.status == KeyStatus::Rotating);
                if wanted && key.expires_at > now {
                    keys.push(key);
                }
            }
        }
        keys.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(keys)
    }

    /// Sweep expired keys and lapsed grace periods. Returns how many records
    /// transitioned.
    pub async fn process_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let now_score = now.timestamp() as f64;
        let mut processed = 0;

        // Keys past their natural expiry.
        for id in self
            .store
            .zrange_by_score(EXPIRING_INDEX, 0.0, now_score)
            .await?
        {
            let Ok(key_id) = id.parse::<Uuid>() else {
                continue;
            };
            if self.expire_record(key_id, "expired").await? {
                processed += 1;
            }
            self.store.zrem(EXPIRING_INDEX, &id).await?;
        }

        // Rotating predecessors whose grace window lapsed.
        for id in self
            .store
            .zrange_by_score(ROTATING_INDEX, 0.0, now_score)
            .await?
        {
            let Ok(key_id) = id.parse::<Uuid>() else {
                continue;
            };
            if self.expire_record(key_id, "grace_period_ended").await? {
                processed += 1;
            }
            self.store.zrem(ROTATING_INDEX, &id).await?;
        }

        if processed > 0 {
            info!(processed, "Expired key sweep complete");
        }
        Ok(processed)
    }

    async fn expire_record(&self, key_id: Uuid, cause: &str) -> Result<bool> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().await;

        let Some(mut key) = self.load_record(key_id).await? else {
            return Ok(false);
        };
        if matches!(
            key.status,
            KeyStatus::Expired | KeyStatus::Revoked | KeyStatus::Compromised
        ) {
            return Ok(false);
        }

        self.backup_record(key_id).await?;
        key.status = KeyStatus::Expired;
        self.write_record(&key).await?;

        self.audit.record(&AuditEntry::key_op(
            &key.user_id,
            "api_key_expire",
            key_id.to_string(),
            json!({
                "automatic": true,
                "cause": cause,
                "venue": key.venue.as_str(),
            }),
        ))?;

        debug!(key_id = %key_id, cause, "Key expired");
        self.emit(KeyEvent::Expired { key_id });
        Ok(true)
    }

    /// Version history for (user, venue), oldest first, material masked.
    pub async fn key_history(&self, user_id: &str, venue: &Venue) -> Result<Vec<ApiKey>> {
        let versions = self
            .store
            .hgetall(&Self::version_hash(user_id, venue))
            .await?;

        let mut history = Vec::with_capacity(versions.len());
        for (_, id) in versions {
            let Ok(key_id) = id.parse::<Uuid>() else {
                continue;
            };
            if let Some(mut key) = self.load_record(key_id).await? {
                key.material = mask_secret(&key.material);
                history.push(key);
            }
        }
        history.sort_by_key(|k| k.version);
        Ok(history)
    }

    /// Active keys close enough to expiry to be auto-rotated.
    pub async fn keys_for_auto_rotation(&self) -> Result<Vec<ApiKey>> {
        if !self.settings.auto_rotation_enabled {
            return Ok(Vec::new());
        }
        let threshold = self.settings.auto_rotation_threshold_days;
        Ok(self
            .expiring(threshold, false)
            .await?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .collect())
    }
}
