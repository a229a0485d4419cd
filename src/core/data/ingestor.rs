//! Kline ingest tasks.
//!
//! One task per (symbol, timeframe): subscribes through the exchange
//! adapter, reconnects with jittered exponential backoff on drops,
//! deduplicates updates by timestamp, and emits heartbeats when a stream
//! goes quiet. Bars leave each stream in strictly increasing `ts_ms` order.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::domain::{Bar, Symbol, Timeframe, Venue};
use crate::core::exchange::{ExchangeAdapter, KlineStream, KlineUpdate};
use crate::core::metrics;
use crate::error::Error;

use super::{BarEvent, BarFanout, BarReceiver};

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Ingestor tuning.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Heartbeat after `stale_multiplier × timeframe` without a bar.
    pub stale_multiplier: u32,
    /// Per-subscriber queue capacity.
    pub subscriber_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            stale_multiplier: 3,
            subscriber_capacity: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Exponential backoff with up-to-20% jitter.
struct Backoff {
    config: ReconnectConfig,
    current: Duration,
}

impl Backoff {
    fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter_cap = (base.as_millis() as u64) / 5;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };

        let next = base.mul_f64(self.config.multiplier);
        self.current = next.min(self.config.max_delay);

        base + Duration::from_millis(jitter)
    }
}

/// Owns the ingest tasks and per-stream fan-outs.
pub struct MarketDataIngestor {
    adapter: Arc<dyn ExchangeAdapter>,
    config: IngestorConfig,
    fanouts: DashMap<(Symbol, Timeframe), Arc<BarFanout>>,
}

impl MarketDataIngestor {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, config: IngestorConfig) -> Self {
        Self {
            adapter,
            config,
            fanouts: DashMap::new(),
        }
    }

    fn fanout(&self, symbol: &Symbol, timeframe: Timeframe) -> Arc<BarFanout> {
        self.fanouts
            .entry((symbol.clone(), timeframe))
            .or_insert_with(|| Arc::new(BarFanout::new()))
            .clone()
    }

    /// Subscribe to the bar events of one stream. Can be called before or
    /// after the ingest task is spawned.
    pub fn subscribe(&self, symbol: &Symbol, timeframe: Timeframe) -> BarReceiver {
        self.fanout(symbol, timeframe)
            .subscribe(self.config.subscriber_capacity)
    }

    /// Spawn the ingest task for one stream.
    pub fn spawn(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let adapter = Arc::clone(&self.adapter);
        let fanout = self.fanout(&symbol, timeframe);
        let config = self.config.clone();
        tokio::spawn(async move {
            ingest_loop(adapter, fanout, symbol, timeframe, config, cancel).await;
        })
    }
}

async fn ingest_loop(
    adapter: Arc<dyn ExchangeAdapter>,
    fanout: Arc<BarFanout>,
    symbol: Symbol,
    timeframe: Timeframe,
    config: IngestorConfig,
    cancel: CancellationToken,
) {
    let venue = adapter.venue().clone();
    let mut backoff = Backoff::new(config.reconnect.clone());
    let stale_timeout = timeframe.duration() * config.stale_multiplier;
    let mut first_attempt = true;
    // Survives reconnects so replayed bars cannot break per-stream ordering.
    let mut last_emitted_ts: Option<i64> = None;

    info!(venue = %venue, symbol = %symbol, timeframe = %timeframe, "Ingest task started");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if !first_attempt {
            metrics::INGEST
                .reconnects
                .with_label_values(&[venue.as_str(), symbol.as_str()])
                .inc();
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        first_attempt = false;

        let stream = match adapter.subscribe_klines(&symbol, timeframe, &cancel).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => break,
            Err(err) => {
                warn!(error = %err, symbol = %symbol, "Kline subscription failed");
                continue;
            }
        };
        backoff.reset();

        if read_stream(
            stream,
            &fanout,
            &venue,
            &symbol,
            timeframe,
            stale_timeout,
            &mut last_emitted_ts,
            &cancel,
        )
        .await
        {
            break;
        }
        warn!(venue = %venue, symbol = %symbol, "Kline stream lost; will reconnect");
    }

    fanout.close();
    info!(venue = %venue, symbol = %symbol, "Ingest task stopped");
}

/// Pump one live stream. Returns true on cancellation, false when the
/// connection needs to be re-established.
#[allow(clippy::too_many_arguments)]
async fn read_stream(
    mut stream: Box<dyn KlineStream>,
    fanout: &BarFanout,
    venue: &Venue,
    symbol: &Symbol,
    timeframe: Timeframe,
    stale_timeout: Duration,
    last_emitted_ts: &mut Option<i64>,
    cancel: &CancellationToken,
) -> bool {
    // The bar currently being built from in-progress updates; finalized when
    // a later window supersedes it.
    let mut pending: Option<Bar> = None;

    loop {
        let update = tokio::select! {
            () = cancel.cancelled() => return true,
            update = tokio::time::timeout(stale_timeout, stream.next_update()) => update,
        };

        match update {
            Ok(Some(Ok(kline))) => {
                emit_update(kline, fanout, &mut pending, last_emitted_ts);
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, symbol = %symbol, "Kline stream error");
                return false;
            }
            Ok(None) => {
                debug!(symbol = %symbol, "Kline stream ended");
                return false;
            }
            Err(_) => {
                // Stale: no update within the timeout.
                metrics::INGEST
                    .heartbeats
                    .with_label_values(&[venue.as_str(), symbol.as_str()])
                    .inc();
                fanout.publish(&BarEvent::Heartbeat {
                    venue: venue.clone(),
                    symbol: symbol.clone(),
                    timeframe,
                    last_ts_ms: *last_emitted_ts,
                });
            }
        }
    }
}

fn emit_update(
    kline: KlineUpdate,
    fanout: &BarFanout,
    pending: &mut Option<Bar>,
    last_emitted_ts: &mut Option<i64>,
) {
    let bar = kline.bar;
    metrics::INGEST
        .bars_received
        .with_label_values(&[
            bar.venue.as_str(),
            bar.symbol.as_str(),
            bar.timeframe.as_str(),
        ])
        .inc();

    // Never re-emit or regress: anything at or before the last emitted
    // timestamp is a stale duplicate.
    if last_emitted_ts.is_some_and(|last| bar.ts_ms <= last) {
        return;
    }

    if kline.closed {
        // A closed bar supersedes any pending build for the same window and
        // finalizes an older pending window first.
        if let Some(pending_bar) = pending.take() {
            if pending_bar.ts_ms < bar.ts_ms {
                emit_bar(pending_bar, fanout, last_emitted_ts);
            }
        }
        emit_bar(bar, fanout, last_emitted_ts);
        return;
    }

    match pending {
        Some(current) if current.ts_ms == bar.ts_ms => {
            // Same-window update replaces the prior snapshot.
            *current = bar;
        }
        Some(current) if bar.ts_ms > current.ts_ms => {
            // A new window opened: the previous one is final.
            let finished = std::mem::replace(current, bar);
            emit_bar(finished, fanout, last_emitted_ts);
        }
        Some(_) => {
            // Older than the pending window: stale, ignore.
        }
        None => *pending = Some(bar),
    }
}

fn emit_bar(bar: Bar, fanout: &BarFanout, last_emitted_ts: &mut Option<i64>) {
    *last_emitted_ts = Some(bar.ts_ms);
    let dropped = fanout.publish(&BarEvent::Bar(bar.clone()));
    if dropped > 0 {
        metrics::INGEST
            .bars_dropped
            .with_label_values(&[
                bar.venue.as_str(),
                bar.symbol.as_str(),
                bar.timeframe.as_str(),
            ])
            .inc_by(dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exchange::MockAdapter;
    use crate::testkit::bar_at;

    fn update(ts_ms: i64, close: f64, closed: bool) -> KlineUpdate {
        KlineUpdate {
            bar: bar_at(ts_ms, close),
            closed,
        }
    }

    async fn expect_bar(rx: &mut BarReceiver, ts_ms: i64) {
        match rx.recv().await {
            Some(BarEvent::Bar(bar)) => assert_eq!(bar.ts_ms, ts_ms),
            other => panic!("expected bar at {ts_ms}, got {other:?}"),
        }
    }

    fn ingestor() -> (Arc<MockAdapter>, MarketDataIngestor) {
        let adapter = Arc::new(MockAdapter::new());
        let ingestor = MarketDataIngestor::new(
            Arc::clone(&adapter) as Arc<dyn ExchangeAdapter>,
            IngestorConfig::default(),
        );
        (adapter, ingestor)
    }

    #[tokio::test]
    async fn closed_bars_flow_through_in_order() {
        let (adapter, ingestor) = ingestor();
        let symbol: Symbol = "BTCUSDT".into();
        let handle = adapter.kline_handle(&symbol, Timeframe::M1);
        let mut rx = ingestor.subscribe(&symbol, Timeframe::M1);

        let cancel = CancellationToken::new();
        let task = ingestor.spawn(symbol.clone(), Timeframe::M1, cancel.clone());

        handle.push(update(60_000, 100.0, true));
        handle.push(update(120_000, 101.0, true));

        expect_bar(&mut rx, 60_000).await;
        expect_bar(&mut rx, 120_000).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn same_timestamp_updates_replace_prior() {
        let (adapter, ingestor) = ingestor();
        let symbol: Symbol = "BTCUSDT".into();
        let handle = adapter.kline_handle(&symbol, Timeframe::M1);
        let mut rx = ingestor.subscribe(&symbol, Timeframe::M1);

        let cancel = CancellationToken::new();
        let task = ingestor.spawn(symbol.clone(), Timeframe::M1, cancel.clone());

        // Three in-progress updates of the same window, then the next window
        // opens: exactly one bar (the last snapshot) is emitted.
        handle.push(update(60_000, 100.0, false));
        handle.push(update(60_000, 100.5, false));
        handle.push(update(60_000, 101.0, false));
        handle.push(update(120_000, 102.0, false));

        match rx.recv().await {
            Some(BarEvent::Bar(bar)) => {
                assert_eq!(bar.ts_ms, 60_000);
                assert!((bar.close - 101.0).abs() < 1e-9);
            }
            other => panic!("expected finalized bar, got {other:?}"),
        }
        assert!(rx.try_recv().is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_flag_finalizes_immediately_and_dedupes() {
        let (adapter, ingestor) = ingestor();
        let symbol: Symbol = "BTCUSDT".into();
        let handle = adapter.kline_handle(&symbol, Timeframe::M1);
        let mut rx = ingestor.subscribe(&symbol, Timeframe::M1);

        let cancel = CancellationToken::new();
        let task = ingestor.spawn(symbol.clone(), Timeframe::M1, cancel.clone());

        handle.push(update(60_000, 100.0, false));
        handle.push(update(60_000, 100.7, true));
        // Late duplicate of an emitted window is ignored.
        handle.push(update(60_000, 99.0, true));
        handle.push(update(120_000, 101.0, true));

        match rx.recv().await {
            Some(BarEvent::Bar(bar)) => {
                assert_eq!(bar.ts_ms, 60_000);
                assert!((bar.close - 100.7).abs() < 1e-9);
            }
            other => panic!("expected closed bar, got {other:?}"),
        }
        expect_bar(&mut rx, 120_000).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_on_stale_stream() {
        let (adapter, ingestor) = ingestor();
        let symbol: Symbol = "BTCUSDT".into();
        let handle = adapter.kline_handle(&symbol, Timeframe::M1);
        let mut rx = ingestor.subscribe(&symbol, Timeframe::M1);

        let cancel = CancellationToken::new();
        let task = ingestor.spawn(symbol.clone(), Timeframe::M1, cancel.clone());

        handle.push(update(60_000, 100.0, true));
        expect_bar(&mut rx, 60_000).await;

        // 3 × 1m with no updates → heartbeat.
        tokio::time::advance(Duration::from_secs(181)).await;
        match rx.recv().await {
            Some(BarEvent::Heartbeat { last_ts_ms, .. }) => {
                assert_eq!(last_ts_ms, Some(60_000));
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_stream_error() {
        let (adapter, ingestor) = ingestor();
        let symbol: Symbol = "BTCUSDT".into();
        let handle = adapter.kline_handle(&symbol, Timeframe::M1);
        let mut rx = ingestor.subscribe(&symbol, Timeframe::M1);

        let cancel = CancellationToken::new();
        let task = ingestor.spawn(symbol.clone(), Timeframe::M1, cancel.clone());

        handle.push(update(60_000, 100.0, true));
        expect_bar(&mut rx, 60_000).await;

        // Break the stream; the task reconnects to the same feed and keeps
        // delivering, preserving order.
        handle.push_error(Error::Transient("socket closed".into()));
        handle.push(update(120_000, 101.0, true));
        expect_bar(&mut rx, 120_000).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
        });

        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(120));
        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(240));
        let d3 = backoff.next_delay();
        assert!(d3 >= Duration::from_millis(400) && d3 <= Duration::from_millis(480));
        // Capped.
        let d4 = backoff.next_delay();
        assert!(d4 >= Duration::from_millis(400) && d4 <= Duration::from_millis(480));

        backoff.reset();
        let d5 = backoff.next_delay();
        assert!(d5 <= Duration::from_millis(120));
    }
}
