//! Engine metrics.
//!
//! A single shared registry, initialized once at startup and never torn
//! down. Handles are grouped per component; [`render`] produces the
//! Prometheus text exposition format for whatever scrapes it.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Process-wide metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Order-execution metrics (reliable executor).
pub struct ExecutorMetrics {
    pub order_attempts: IntCounterVec,
    pub order_success: IntCounterVec,
    pub order_failures: IntCounterVec,
    pub order_latency: HistogramVec,
    /// 0 = closed, 1 = open, 2 = half-open.
    pub circuit_state: IntGauge,
    /// Error rate over the rolling outcome window, in percent.
    pub error_rate: Gauge,
    pub dedup_hits: IntCounterVec,
}

pub static EXECUTOR: Lazy<ExecutorMetrics> = Lazy::new(|| {
    let order_attempts = IntCounterVec::new(
        Opts::new("exchange_order_attempts", "Total order attempts"),
        &["symbol", "side"],
    )
    .expect("metric definition");
    let order_success = IntCounterVec::new(
        Opts::new("exchange_order_success", "Successful orders"),
        &["symbol", "side"],
    )
    .expect("metric definition");
    let order_failures = IntCounterVec::new(
        Opts::new("exchange_order_failures", "Failed orders"),
        &["symbol", "side"],
    )
    .expect("metric definition");
    let order_latency = HistogramVec::new(
        HistogramOpts::new(
            "exchange_order_latency",
            "Order execution latency in seconds",
        ),
        &["symbol"],
    )
    .expect("metric definition");
    let circuit_state = IntGauge::new(
        "exchange_circuit_state",
        "Circuit breaker state (0=closed, 1=open, 2=half_open)",
    )
    .expect("metric definition");
    let error_rate = Gauge::new("exchange_error_rate", "Current error rate percentage")
        .expect("metric definition");
    let dedup_hits = IntCounterVec::new(
        Opts::new(
            "exchange_order_dedup_hits",
            "Duplicate submissions answered from the idempotency cache",
        ),
        &["symbol"],
    )
    .expect("metric definition");

    register(order_attempts.clone());
    register(order_success.clone());
    register(order_failures.clone());
    register(order_latency.clone());
    register(circuit_state.clone());
    register(error_rate.clone());
    register(dedup_hits.clone());

    ExecutorMetrics {
        order_attempts,
        order_success,
        order_failures,
        order_latency,
        circuit_state,
        error_rate,
        dedup_hits,
    }
});

/// Market-data ingest metrics.
pub struct IngestMetrics {
    pub bars_received: IntCounterVec,
    pub bars_dropped: IntCounterVec,
    pub reconnects: IntCounterVec,
    pub heartbeats: IntCounterVec,
}

pub static INGEST: Lazy<IngestMetrics> = Lazy::new(|| {
    let bars_received = IntCounterVec::new(
        Opts::new("ingest_bars_received", "Bars received from venue streams"),
        &["venue", "symbol", "timeframe"],
    )
    .expect("metric definition");
    let bars_dropped = IntCounterVec::new(
        Opts::new(
            "ingest_bars_dropped",
            "Bars dropped for slow subscribers (oldest-first)",
        ),
        &["venue", "symbol", "timeframe"],
    )
    .expect("metric definition");
    let reconnects = IntCounterVec::new(
        Opts::new("ingest_reconnects", "Kline stream reconnect attempts"),
        &["venue", "symbol"],
    )
    .expect("metric definition");
    let heartbeats = IntCounterVec::new(
        Opts::new("ingest_heartbeats", "Heartbeats emitted on stale streams"),
        &["venue", "symbol"],
    )
    .expect("metric definition");

    register(bars_received.clone());
    register(bars_dropped.clone());
    register(reconnects.clone());
    register(heartbeats.clone());

    IngestMetrics {
        bars_received,
        bars_dropped,
        reconnects,
        heartbeats,
    }
});

/// Dispatcher metrics.
pub struct DispatchMetrics {
    pub signals_received: IntCounterVec,
    pub signals_dropped_in_flight: IntCounterVec,
    pub risk_rejects: IntCounterVec,
    pub orders_quarantined: IntCounterVec,
}

pub static DISPATCH: Lazy<DispatchMetrics> = Lazy::new(|| {
    let signals_received = IntCounterVec::new(
        Opts::new("dispatch_signals_received", "Signals received"),
        &["symbol", "kind"],
    )
    .expect("metric definition");
    let signals_dropped_in_flight = IntCounterVec::new(
        Opts::new(
            "dispatch_signals_dropped_in_flight",
            "Signals dropped because an order was already in flight",
        ),
        &["symbol"],
    )
    .expect("metric definition");
    let risk_rejects = IntCounterVec::new(
        Opts::new("dispatch_risk_rejects", "Orders rejected by risk rules"),
        &["symbol", "rule"],
    )
    .expect("metric definition");
    let orders_quarantined = IntCounterVec::new(
        Opts::new(
            "dispatch_orders_quarantined",
            "Orders with unknown status parked for operator review",
        ),
        &["symbol"],
    )
    .expect("metric definition");

    register(signals_received.clone());
    register(signals_dropped_in_flight.clone());
    register(risk_rejects.clone());
    register(orders_quarantined.clone());

    DispatchMetrics {
        signals_received,
        signals_dropped_in_flight,
        risk_rejects,
        orders_quarantined,
    }
});

fn register<C: prometheus::core::Collector + 'static>(collector: C) {
    // Double registration only happens if a Lazy is re-run, which it cannot be.
    REGISTRY
        .register(Box::new(collector))
        .expect("metric registration");
}

/// Render the registry in Prometheus text exposition format.
#[must_use]
pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
