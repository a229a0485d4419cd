//! Shared helpers for the integration suites.

// Each test binary compiles its own copy; not every binary uses every helper.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Await `future` with a hard timeout, panicking with context on expiry.
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(5), future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
