//! Background sweepers for the key manager.
//!
//! Three periodic loops: expiration (moves lapsed keys to `expired`),
//! notification (emits expiry warnings at configured day buckets), and
//! auto-rotation (rotates keys that are close to expiry). Each loop honors
//! the supervisor's cancellation token between runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{KeyManager, RequestContext};

/// Sweep intervals.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub expiration_interval: Duration,
    pub notification_interval: Duration,
    pub auto_rotation_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(3600),
            notification_interval: Duration::from_secs(86_400),
            auto_rotation_interval: Duration::from_secs(86_400),
        }
    }
}

/// Handles to the three sweeper tasks.
pub struct KeySweepers {
    handles: Vec<JoinHandle<()>>,
}

impl KeySweepers {
    /// Spawn the sweepers. They stop when `cancel` trips.
    pub fn spawn(
        manager: Arc<KeyManager>,
        config: SweeperConfig,
        cancel: CancellationToken,
    ) -> Self {
        let handles = vec![
            tokio::spawn(expiration_loop(
                Arc::clone(&manager),
                config.expiration_interval,
                cancel.clone(),
            )),
            tokio::spawn(notification_loop(
                Arc::clone(&manager),
                config.notification_interval,
                cancel.clone(),
            )),
            tokio::spawn(auto_rotation_loop(
                manager,
                config.auto_rotation_interval,
                cancel,
            )),
        ];
        info!("Key sweepers started");
        Self { handles }
    }

    /// Wait for all sweepers to finish (after cancellation).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn tick(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(interval) => true,
    }
}

async fn expiration_loop(
    manager: Arc<KeyManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match manager.process_expired().await {
            Ok(processed) if processed > 0 => {
                debug!(processed, "Expiration sweep transitioned keys");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Expiration sweep failed"),
        }
        if !tick(interval, &cancel).await {
            break;
        }
    }
    debug!("Expiration sweeper stopped");
}

async fn notification_loop(
    manager: Arc<KeyManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // Remember (key, bucket) pairs already announced so a daily sweep does
    // not repeat warnings.
    let mut announced: HashSet<(Uuid, i64)> = HashSet::new();

    loop {
        let window = manager
            .settings()
            .notification_days
            .iter()
            .copied()
            .max()
            .unwrap_or(30);

        match manager.expiring(window, false).await {
            Ok(keys) => {
                for key in keys {
                    let days_left = (key.expires_at - manager_now(&manager)).num_days();
                    let Some(bucket) = manager
                        .settings()
                        .notification_days
                        .iter()
                        .copied()
                        .find(|b| days_left <= *b)
                    else {
                        continue;
                    };
                    if announced.insert((key.key_id, bucket)) {
                        info!(
                            key_id = %key.key_id,
                            user = %key.user_id,
                            days_left,
                            "Key expiring soon"
                        );
                        manager.emit_expiry_warning(&key, days_left);
                    }
                }
            }
            Err(err) => warn!(error = %err, "Notification sweep failed"),
        }
        if !tick(interval, &cancel).await {
            break;
        }
    }
    debug!("Notification sweeper stopped");
}

async fn auto_rotation_loop(
    manager: Arc<KeyManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match manager.keys_for_auto_rotation().await {
            Ok(candidates) => {
                let mut rotated = 0usize;
                for key in candidates {
                    let result = manager
                        .rotate(
                            key.key_id,
                            &key.user_id.clone(),
                            true,
                            None,
                            &RequestContext::default(),
                        )
                        .await;
                    match result {
                        Ok(_) => rotated += 1,
                        Err(err) => {
                            warn!(key_id = %key.key_id, error = %err, "Auto-rotation failed");
                        }
                    }
                }
                if rotated > 0 {
                    info!(rotated, "Auto-rotated expiring keys");
                }
            }
            Err(err) => warn!(error = %err, "Auto-rotation sweep failed"),
        }
        if !tick(interval, &cancel).await {
            break;
        }
    }
    debug!("Auto-rotation sweeper stopped");
}

fn manager_now(manager: &KeyManager) -> chrono::DateTime<chrono::Utc> {
    manager.now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::{
        AuditLog, CreateKeyRequest, KeyEvent, KeySettings, KeyStatus, MemoryStore, SecretCipher,
    };
    use crate::testkit::ManualClock;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn manager_with_clock() -> (Arc<KeyManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let manager = Arc::new(KeyManager::new(
            Arc::new(MemoryStore::new()),
            SecretCipher::new("secret", "salt").unwrap(),
            Arc::new(AuditLog::open(":memory:").unwrap()),
            clock.clone(),
            KeySettings::default(),
        ));
        (manager, clock)
    }

    fn request(user: &str, expiry_days: i64) -> CreateKeyRequest {
        CreateKeyRequest {
            user_id: user.into(),
            venue: "binance".into(),
            description: String::new(),
            permissions: vec![],
            expiry_days: Some(expiry_days),
            require_approval: false,
            ip_restrictions: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_sweeper_expires_lapsed_keys() {
        let (manager, clock) = manager_with_clock();
        let key = manager
            .create(request("alice", 1), &RequestContext::default())
            .await
            .unwrap();

        clock.advance(TimeDelta::days(2));
        let cancel = CancellationToken::new();
        let sweepers = KeySweepers::spawn(
            Arc::clone(&manager),
            SweeperConfig {
                expiration_interval: Duration::from_secs(60),
                notification_interval: Duration::from_secs(3600),
                auto_rotation_interval: Duration::from_secs(3600),
            },
            cancel.clone(),
        );

        // First sweep runs immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            manager.get(key.key_id).await.unwrap().status,
            KeyStatus::Expired
        );

        cancel.cancel();
        sweepers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn notification_sweeper_emits_each_bucket_once() {
        let (manager, _clock) = manager_with_clock();
        manager
            .create(request("alice", 3), &RequestContext::default())
            .await
            .unwrap();
        // Subscribed after creation, so the first event is the warning.
        let mut events = manager.subscribe();

        let cancel = CancellationToken::new();
        let sweepers = KeySweepers::spawn(
            Arc::clone(&manager),
            SweeperConfig {
                expiration_interval: Duration::from_secs(86_400),
                notification_interval: Duration::from_secs(60),
                auto_rotation_interval: Duration::from_secs(86_400),
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let event = events.try_recv().unwrap();
        match event {
            KeyEvent::ExpiryWarning { days_left, .. } => assert!(days_left <= 3),
            other => panic!("expected expiry warning, got {other:?}"),
        }

        // A second sweep does not repeat the warning.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));

        cancel.cancel();
        sweepers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn auto_rotation_sweeper_rotates_near_expiry_keys() {
        let (manager, _clock) = manager_with_clock();
        let key = manager
            .create(request("alice", 3), &RequestContext::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let sweepers = KeySweepers::spawn(
            Arc::clone(&manager),
            SweeperConfig {
                expiration_interval: Duration::from_secs(86_400),
                notification_interval: Duration::from_secs(86_400),
                auto_rotation_interval: Duration::from_secs(60),
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let rotated = manager.get(key.key_id).await.unwrap();
        assert_eq!(rotated.status, KeyStatus::Rotating);
        assert!(rotated.rotation.is_some());

        cancel.cancel();
        sweepers.join().await;
    }
}
