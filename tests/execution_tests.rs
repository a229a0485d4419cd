//! Reliable-executor behavior through the public API: retry, circuit
//! breaker, verification, idempotency.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tradewind::core::domain::{OrderRequest, OrderSide, OrderState, Venue};
use tradewind::core::exchange::{ExchangeAdapter, MockAdapter, MockBehavior};
use tradewind::core::executor::{CircuitState, ExecutorConfig, ReliableExecutor};
use tradewind::error::Error;

fn setup(config: ExecutorConfig) -> (Arc<MockAdapter>, Arc<ReliableExecutor>) {
    let adapter = Arc::new(MockAdapter::new());
    let executor = Arc::new(ReliableExecutor::new(
        Arc::clone(&adapter) as Arc<dyn ExchangeAdapter>,
        config,
    ));
    (adapter, executor)
}

fn market_buy(amount: f64) -> OrderRequest {
    OrderRequest::market(Venue::new("mock"), "BTCUSDT".into(), OrderSide::Buy, amount)
}

#[tokio::test(start_paused = true)]
async fn transient_storm_then_success_equals_one_submission() {
    let (adapter, executor) = setup(ExecutorConfig::default());
    let token = CancellationToken::new();
    adapter.set_last_price(&"BTCUSDT".into(), 30_000.0);
    adapter.force_errors(Error::Transient("flaky edge".into()), 3);

    let verified = executor.place_order(&market_buy(0.5), &token).await.unwrap();

    assert!(verified.verified);
    assert_eq!(verified.status.state, OrderState::Filled);
    // The venue saw exactly one order despite three failed attempts.
    assert_eq!(adapter.place_order_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_then_probes_after_timeout() {
    let config = ExecutorConfig {
        max_retries: 0,
        ..ExecutorConfig::default()
    };
    let (adapter, executor) = setup(config);
    let token = CancellationToken::new();

    // Ten consecutive transient failures trip the breaker.
    adapter.force_errors(Error::Transient("venue down".into()), 10);
    for _ in 0..10 {
        let result = executor.place_order(&market_buy(1.0), &token).await;
        assert!(result.is_err());
    }
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    // The eleventh submission fails fast without an adapter call.
    let calls_before = adapter.place_order_calls();
    let result = executor.place_order(&market_buy(1.0), &token).await;
    assert!(matches!(result, Err(Error::CircuitOpen)));
    assert_eq!(adapter.place_order_calls(), calls_before);

    // After the open timeout one probe goes through and closes the circuit.
    tokio::time::advance(Duration::from_secs(61)).await;
    let verified = executor.place_order(&market_buy(1.0), &token).await.unwrap();
    assert!(verified.verified);
    assert_eq!(executor.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_circuit() {
    let config = ExecutorConfig {
        max_retries: 0,
        ..ExecutorConfig::default()
    };
    let (adapter, executor) = setup(config);
    let token = CancellationToken::new();

    adapter.force_errors(Error::Transient("venue down".into()), 10);
    for _ in 0..10 {
        let _ = executor.place_order(&market_buy(1.0), &token).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    // Probe fails → straight back to open.
    adapter.force_error(Error::Transient("still down".into()));
    let result = executor.place_order(&market_buy(1.0), &token).await;
    assert!(result.is_err());
    assert_eq!(executor.circuit_state(), CircuitState::Open);
}

#[tokio::test]
async fn duplicate_client_ids_share_one_venue_order() {
    let (adapter, executor) = setup(ExecutorConfig::default());
    let token = CancellationToken::new();
    adapter.set_latency(Duration::from_millis(50));
    adapter.set_last_price(&"BTCUSDT".into(), 100.0);

    let request = market_buy(1.0);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let executor = Arc::clone(&executor);
        let request = request.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            executor.place_order(&request, &token).await
        }));
    }

    let mut order_ids = Vec::new();
    for handle in handles {
        let verified = support::within("duplicate submission", handle)
            .await
            .unwrap()
            .unwrap();
        order_ids.push(verified.status.exchange_order_id);
    }

    order_ids.dedup();
    assert_eq!(order_ids.len(), 1, "all submitters saw the same order");
    assert_eq!(adapter.place_order_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_replays_cached_outcome() {
    let (adapter, executor) = setup(ExecutorConfig::default());
    let token = CancellationToken::new();
    adapter.set_last_price(&"BTCUSDT".into(), 100.0);

    let request = market_buy(0.25);
    let first = executor.place_order(&request, &token).await.unwrap();
    let second = executor.place_order(&request, &token).await.unwrap();

    assert_eq!(
        first.status.exchange_order_id,
        second.status.exchange_order_id
    );
    assert_eq!(adapter.place_order_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn dedup_window_expires() {
    let (adapter, executor) = setup(ExecutorConfig {
        dedup_ttl: Duration::from_secs(60),
        ..ExecutorConfig::default()
    });
    let token = CancellationToken::new();

    let request = market_buy(0.25);
    executor.place_order(&request, &token).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    executor.place_order(&request, &token).await.unwrap();

    // Outside the window the same client_id submits again.
    assert_eq!(adapter.place_order_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_terminal() {
    let (adapter, executor) = setup(ExecutorConfig::default());
    let token = CancellationToken::new();
    adapter.force_error(Error::AuthFailed("revoked key".into()));

    let result = executor.place_order(&market_buy(1.0), &token).await;
    assert!(matches!(result, Err(Error::AuthFailed(_))));
    assert_eq!(adapter.place_order_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unverifiable_order_is_flagged() {
    let (adapter, executor) = setup(ExecutorConfig::default());
    let token = CancellationToken::new();
    adapter.set_behavior(MockBehavior::NeverFill);

    let request = market_buy(1.0);
    let verified = executor.place_order(&request, &token).await.unwrap();

    assert!(!verified.verified);
    assert_eq!(verified.status.state, OrderState::Unknown);
    assert!(verified.confirmed_fill(&request).is_none());
}
