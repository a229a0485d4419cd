//! Key-manager lifecycle through the public API: rotation grace windows,
//! terminal states, validation invariants, sweepers.

mod support;

use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};

use tradewind::core::domain::Venue;
use tradewind::core::keys::{
    AuditLog, CreateKeyRequest, KeyManager, KeySettings, KeyStatus, MemoryStore, RequestContext,
    SecretCipher,
};
use tradewind::error::Error;
use tradewind::testkit::ManualClock;

fn manager() -> (Arc<KeyManager>, Arc<ManualClock>) {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).unwrap());
    let manager = Arc::new(KeyManager::new(
        Arc::new(MemoryStore::new()),
        SecretCipher::new("integration-secret", "integration-salt").unwrap(),
        Arc::new(AuditLog::open(":memory:").unwrap()),
        clock.clone(),
        KeySettings::default(),
    ));
    (manager, clock)
}

fn request(user: &str, venue: &str) -> CreateKeyRequest {
    CreateKeyRequest {
        user_id: user.into(),
        venue: venue.into(),
        description: "integration".into(),
        permissions: vec!["read".into(), "trade".into()],
        expiry_days: Some(90),
        require_approval: false,
        ip_restrictions: vec![],
    }
}

#[tokio::test]
async fn rotation_grace_window_end_to_end() {
    let (manager, clock) = manager();
    let ctx = RequestContext::default();

    // Create K1 (active), rotate with one hour of grace → K2 active,
    // K1 rotating.
    let k1 = manager.create(request("alice", "binance"), &ctx).await.unwrap();
    let k2 = manager
        .rotate(k1.key_id, "alice", false, Some(1), &ctx)
        .await
        .unwrap();

    let k1_record = manager.get(k1.key_id).await.unwrap();
    assert_eq!(k1_record.status, KeyStatus::Rotating);
    assert_eq!(k2.status, KeyStatus::Active);

    // Both validate during grace.
    assert!(manager.validate(&k1.material, &ctx).await.unwrap().0);
    assert!(manager.validate(&k2.material, &ctx).await.unwrap().0);

    // Advance past the grace deadline and sweep: K1 expires, K2 survives.
    clock.advance(TimeDelta::minutes(61));
    let processed = manager.process_expired().await.unwrap();
    assert_eq!(processed, 1);

    assert!(!manager.validate(&k1.material, &ctx).await.unwrap().0);
    assert!(manager.validate(&k2.material, &ctx).await.unwrap().0);
    assert_eq!(
        manager.get(k1.key_id).await.unwrap().status,
        KeyStatus::Expired
    );
}

#[tokio::test]
async fn at_most_one_active_key_per_user_venue() {
    let (manager, _clock) = manager();
    let ctx = RequestContext::default();

    manager.create(request("alice", "binance"), &ctx).await.unwrap();
    // Second active key for the same (user, venue) is refused.
    assert!(matches!(
        manager.create(request("alice", "binance"), &ctx).await,
        Err(Error::BadState(_))
    ));
    // Other venue and other user are both fine.
    manager.create(request("alice", "kraken"), &ctx).await.unwrap();
    manager.create(request("bob", "binance"), &ctx).await.unwrap();

    let keys = manager.user_keys("alice", true).await.unwrap();
    let active_binance = keys
        .iter()
        .filter(|k| k.venue == Venue::new("binance") && k.status == KeyStatus::Active)
        .count();
    assert_eq!(active_binance, 1);
}

#[tokio::test]
async fn rotating_records_carry_grace_and_successor() {
    let (manager, _clock) = manager();
    let ctx = RequestContext::default();

    let k1 = manager.create(request("alice", "binance"), &ctx).await.unwrap();
    let k2 = manager
        .rotate(k1.key_id, "alice", false, Some(6), &ctx)
        .await
        .unwrap();

    let rotating = manager.get(k1.key_id).await.unwrap();
    let meta = rotating.rotation.expect("rotating key has metadata");
    assert!(meta.grace_period_ends > rotating.created_at);
    assert_eq!(meta.successor_id, k2.key_id);
}

#[tokio::test]
async fn revoked_and_compromised_never_validate_again() {
    let (manager, clock) = manager();
    let ctx = RequestContext::default();

    let revoked = manager.create(request("alice", "binance"), &ctx).await.unwrap();
    manager
        .revoke(revoked.key_id, "alice", false, "off-boarding", &ctx)
        .await
        .unwrap();

    let compromised = manager.create(request("bob", "binance"), &ctx).await.unwrap();
    manager
        .mark_compromised(compromised.key_id, "bob", false, "pasted in chat", &ctx)
        .await
        .unwrap();

    // Not now, not later, not after sweeps.
    for _ in 0..3 {
        assert!(!manager.validate(&revoked.material, &ctx).await.unwrap().0);
        assert!(!manager.validate(&compromised.material, &ctx).await.unwrap().0);
        clock.advance(TimeDelta::days(30));
        manager.process_expired().await.unwrap();
    }

    assert_eq!(
        manager.get(revoked.key_id).await.unwrap().status,
        KeyStatus::Revoked
    );
    assert_eq!(
        manager.get(compromised.key_id).await.unwrap().status,
        KeyStatus::Compromised
    );
}

#[tokio::test]
async fn expired_keys_fail_validation_after_sweep() {
    let (manager, clock) = manager();
    let ctx = RequestContext::default();

    let mut req = request("alice", "binance");
    req.expiry_days = Some(10);
    let key = manager.create(req, &ctx).await.unwrap();

    clock.advance(TimeDelta::days(9));
    assert!(manager.validate(&key.material, &ctx).await.unwrap().0);

    clock.advance(TimeDelta::days(2));
    // Even before the sweep runs, validation checks expiry.
    assert!(!manager.validate(&key.material, &ctx).await.unwrap().0);

    manager.process_expired().await.unwrap();
    assert_eq!(
        manager.get(key.key_id).await.unwrap().status,
        KeyStatus::Expired
    );
}

#[tokio::test]
async fn audit_trail_masks_high_severity_details() {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).unwrap());
    let audit = Arc::new(AuditLog::open(":memory:").unwrap());
    let manager = Arc::new(KeyManager::new(
        Arc::new(MemoryStore::new()),
        SecretCipher::new("integration-secret", "integration-salt").unwrap(),
        Arc::clone(&audit),
        clock,
        KeySettings::default(),
    ));
    let ctx = RequestContext::default();

    let key = manager.create(request("alice", "binance"), &ctx).await.unwrap();
    manager
        .mark_compromised(key.key_id, "alice", false, "leaked", &ctx)
        .await
        .unwrap();

    let rows = audit.recent(10).unwrap();
    let compromise_row = rows
        .iter()
        .find(|r| r.action == "api_key_compromised")
        .expect("compromise audit row");
    assert_eq!(compromise_row.severity, "critical");
    let masked = compromise_row
        .masked_details
        .as_ref()
        .expect("masked details for critical events");
    assert!(!masked.contains(&key.material));
}

#[tokio::test]
async fn successor_inherits_permissions_and_restrictions() {
    let (manager, _clock) = manager();
    let ctx = RequestContext::default();

    let mut req = request("alice", "binance");
    req.permissions = vec!["read".into()];
    req.ip_restrictions = vec!["198.51.100.7".into()];
    let k1 = manager.create(req, &ctx).await.unwrap();
    let k2 = manager
        .rotate(k1.key_id, "alice", false, None, &ctx)
        .await
        .unwrap();

    assert_eq!(k2.permissions, vec!["read".to_string()]);
    assert_eq!(k2.ip_restrictions, vec!["198.51.100.7".to_string()]);
    assert_eq!(k2.expires_at, k1.expires_at);
    assert_eq!(k2.version, k1.version + 1);
}
