// =============================================================================
// Candle aggregator — folds ticker events into per-symbol base bars
// =============================================================================
//
// One open bar per symbol. A ticker event either folds into the current
// bucket (high/low stretch, close replace) or rolls the bar over: the old
// bar is closed and emitted, a new one opens at the event price.
//
// Emitting = candle-store write + candle-close publish + registered
// listeners. A store or publish failure is logged; the in-memory bar is not
// rolled back, so the next rollover proceeds from consistent local state.
//
// Volume is intentionally not accumulated here — the 24h ticker carries it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::strategies::CandleStore;
use crate::timeframe::Timeframe;
use crate::types::Candle;

/// The in-progress bar for one symbol.
#[derive(Debug, Clone)]
pub struct OpenBar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl OpenBar {
    fn start(timestamp: i64, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            is_closed: false,
        }
    }

    fn into_candle(self, symbol: &str, tf: Timeframe) -> Candle {
        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            symbol: symbol.to_string(),
            timeframe: tf,
            is_synthetic: false,
        }
    }
}

type CloseListener = Box<dyn Fn(&Candle) + Send + Sync>;

pub struct CandleAggregator {
    store: Arc<CandleStore>,
    timeframe: Timeframe,
    bars: RwLock<HashMap<String, OpenBar>>,
    listeners: RwLock<Vec<CloseListener>>,
}

impl CandleAggregator {
    /// Create an aggregator producing bars on `timeframe` (the instance's
    /// base timeframe, normally 1m).
    pub fn new(store: Arc<CandleStore>, timeframe: Timeframe) -> Self {
        Self {
            store,
            timeframe,
            bars: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener invoked with every closed bar, after the store
    /// write and publish.
    pub fn on_close(&self, listener: impl Fn(&Candle) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Fold one ticker event. Returns the bar that closed, if this event
    /// rolled the bucket over.
    pub async fn on_ticker(&self, symbol: &str, price: f64, event_time: i64) -> Option<Candle> {
        if !price.is_finite() || price <= 0.0 {
            debug!(symbol, price, "dropping ticker with unusable price");
            return None;
        }

        let bucket = self.timeframe.bucket(event_time);

        // Fold under the lock, emit after releasing it.
        let closed: Option<Candle> = {
            let mut bars = self.bars.write();
            let rolls_over = bars
                .get(symbol)
                .map_or(true, |bar| bucket > bar.timestamp);

            if rolls_over {
                let previous = bars.insert(symbol.to_string(), OpenBar::start(bucket, price));
                previous.filter(|b| !b.is_closed).map(|mut b| {
                    b.is_closed = true;
                    b.into_candle(symbol, self.timeframe)
                })
            } else if let Some(bar) = bars.get_mut(symbol) {
                // Same bucket (or a late event): stretch the range and take
                // the price as the running close — last event wins.
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                None
            } else {
                None
            }
        };

        if let Some(candle) = &closed {
            self.emit(candle).await;
        }
        closed
    }

    /// Snapshot of the in-progress bar for `symbol`.
    pub fn open_bar(&self, symbol: &str) -> Option<OpenBar> {
        self.bars.read().get(symbol).cloned()
    }

    /// Drop all open bars (used when the monitored symbol set changes).
    pub fn reset(&self) {
        self.bars.write().clear();
    }

    async fn emit(&self, candle: &Candle) {
        if let Err(e) = self.store.add_candles(std::slice::from_ref(candle)).await {
            warn!(symbol = %candle.symbol, ts = candle.timestamp, error = %e, "candle store write failed");
        }
        if let Err(e) = self.store.publish_close(candle).await {
            warn!(symbol = %candle.symbol, ts = candle.timestamp, error = %e, "candle-close publish failed");
        }
        for listener in self.listeners.read().iter() {
            listener(candle);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::cache::CacheService;
    use crate::cache_keys::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aggregator() -> (CandleAggregator, Arc<dyn CacheService>) {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let store = Arc::new(CandleStore::new(cache.clone(), Scope::new("u", "ex")));
        (CandleAggregator::new(store, Timeframe::M1), cache)
    }

    #[tokio::test]
    async fn first_event_opens_bar_no_emit() {
        let (agg, _) = aggregator();
        let closed = agg.on_ticker("BTC-USD", 100.0, 61_500).await;
        assert!(closed.is_none());

        let bar = agg.open_bar("BTC-USD").unwrap();
        assert_eq!(bar.timestamp, 60_000);
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.volume - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn same_bucket_folds_range_and_close() {
        let (agg, _) = aggregator();
        agg.on_ticker("BTC-USD", 100.0, 60_000).await;
        agg.on_ticker("BTC-USD", 104.0, 60_010).await;
        agg.on_ticker("BTC-USD", 98.0, 60_020).await;
        // Identical event time: last event wins for close.
        agg.on_ticker("BTC-USD", 101.0, 60_020).await;

        let bar = agg.open_bar("BTC-USD").unwrap();
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.high - 104.0).abs() < f64::EPSILON);
        assert!((bar.low - 98.0).abs() < f64::EPSILON);
        assert!((bar.close - 101.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rollover_closes_and_emits() {
        let (agg, cache) = aggregator();
        let scope = Scope::new("u", "ex");
        let mut sub = cache
            .subscribe(&[scope.candle_close_pattern(Timeframe::M1)])
            .await
            .unwrap();

        agg.on_ticker("BTC-USD", 100.0, 60_000).await;
        agg.on_ticker("BTC-USD", 103.0, 60_500).await;
        let closed = agg.on_ticker("BTC-USD", 105.0, 120_000).await.unwrap();

        // Closed bar invariants.
        assert_eq!(closed.timestamp, 60_000);
        assert_eq!(closed.timestamp % Timeframe::M1.ms(), 0);
        assert!(closed.low <= closed.open.min(closed.close));
        assert!(closed.open.max(closed.close) <= closed.high);
        assert!((closed.close - 103.0).abs() < f64::EPSILON);

        // Published...
        let msg = sub.recv().await.unwrap();
        let published: Candle = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(published.timestamp, 60_000);

        // ...and stored.
        let store = CandleStore::new(cache.clone(), scope);
        let stored = store
            .recent_candles("BTC-USD", Timeframe::M1, 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);

        // The new bar opened at the rollover price.
        let bar = agg.open_bar("BTC-USD").unwrap();
        assert_eq!(bar.timestamp, 120_000);
        assert!((bar.open - 105.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn listeners_run_on_every_close() {
        let (agg, _) = aggregator();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        agg.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        agg.on_ticker("BTC-USD", 100.0, 0).await;
        agg.on_ticker("BTC-USD", 101.0, 60_000).await;
        agg.on_ticker("BTC-USD", 102.0, 120_000).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn symbols_are_independent() {
        let (agg, _) = aggregator();
        agg.on_ticker("BTC-USD", 100.0, 0).await;
        agg.on_ticker("ETH-USD", 10.0, 0).await;
        let closed = agg.on_ticker("BTC-USD", 101.0, 60_000).await;
        assert!(closed.is_some());
        // ETH is still on its first bucket.
        assert!(agg.open_bar("ETH-USD").unwrap().timestamp == 0);
    }

    #[tokio::test]
    async fn bad_prices_are_dropped() {
        let (agg, _) = aggregator();
        assert!(agg.on_ticker("BTC-USD", f64::NAN, 0).await.is_none());
        assert!(agg.on_ticker("BTC-USD", 0.0, 0).await.is_none());
        assert!(agg.open_bar("BTC-USD").is_none());
    }
}
