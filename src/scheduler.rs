// =============================================================================
// Indicator scheduler — candle-close events in, indicator updates out
// =============================================================================
//
// Subscribes to the base-timeframe candle-close pattern and, per close event:
//
//   1. recomputes the base timeframe from cached bars (60-bar readiness gate)
//   2. for each configured higher timeframe, advances a per-(symbol, tf)
//      boundary and recomputes when a new bucket has completed, either by
//      reading that timeframe's cached bars directly or by aggregating base
//      bars in memory
//
// The write (`set`) and the publish each run even when the other fails. A
// failure for one (symbol, timeframe) never blocks the others, and nothing
// on this path performs a REST call.
//
// Per (symbol, timeframe) the emitted updates are non-decreasing in bar
// timestamp: one consumer loop handles events sequentially and the boundary
// map suppresses duplicates.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::strategies::{CandleStore, IndicatorStore, CANDLE_BOUND};
use crate::cache::CacheService;
use crate::cache_keys::Scope;
use crate::indicators::gap_fill::{fill_gaps, liquidity_grade, zero_range_ratio};
use crate::indicators::macd_v::{
    self, ATR_PERIOD, FAST_PERIOD, SIGNAL_PERIOD, SLOW_PERIOD,
};
use crate::settings::{Derivation, IndicatorConfig};
use crate::timeframe::Timeframe;
use crate::types::{Candle, IndicatorParams, IndicatorValue, INDICATOR_MACD_V};

/// Bars read per base-timeframe recompute.
const READ_WINDOW: usize = 200;

/// Cached bars required before the first indicator is computed.
const READY_BARS: usize = 60;

pub struct IndicatorScheduler {
    cache: Arc<dyn CacheService>,
    candles: Arc<CandleStore>,
    indicators: Arc<IndicatorStore>,
    scope: Scope,
    base_tf: Timeframe,
    derivation: Derivation,

    symbols: RwLock<HashSet<String>>,
    /// Configured higher timeframes per symbol.
    higher_tfs: RwLock<HashMap<String, Vec<Timeframe>>>,
    /// Last processed bucket per (symbol, higher timeframe).
    last_boundary: Mutex<HashMap<(String, Timeframe), i64>>,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndicatorScheduler {
    pub fn new(
        cache: Arc<dyn CacheService>,
        candles: Arc<CandleStore>,
        indicators: Arc<IndicatorStore>,
        scope: Scope,
        base_tf: Timeframe,
        derivation: Derivation,
    ) -> Self {
        Self {
            cache,
            candles,
            indicators,
            scope,
            base_tf,
            derivation,
            symbols: RwLock::new(HashSet::new()),
            higher_tfs: RwLock::new(HashMap::new()),
            last_boundary: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        }
    }

    /// (Re)build the monitored set and boundary map from a config grid.
    ///
    /// Each (symbol, higher-tf) boundary starts at the bucket containing
    /// `now_ms`, which suppresses an immediate duplicate recompute right
    /// after warm-up backfill.
    pub fn configure(&self, configs: &[IndicatorConfig], now_ms: i64) {
        let mut symbols = HashSet::new();
        let mut higher: HashMap<String, Vec<Timeframe>> = HashMap::new();
        let mut boundaries = HashMap::new();

        for cfg in configs {
            symbols.insert(cfg.symbol.clone());
            if cfg.timeframe == self.base_tf {
                continue;
            }
            if !self.base_tf.derived().contains(&cfg.timeframe) {
                continue;
            }
            let tfs = higher.entry(cfg.symbol.clone()).or_default();
            if !tfs.contains(&cfg.timeframe) {
                tfs.push(cfg.timeframe);
            }
            boundaries.insert(
                (cfg.symbol.clone(), cfg.timeframe),
                cfg.timeframe.bucket(now_ms),
            );
        }
        for tfs in higher.values_mut() {
            tfs.sort();
        }

        info!(
            symbols = symbols.len(),
            base = %self.base_tf,
            derivation = ?self.derivation,
            "indicator scheduler configured"
        );

        *self.symbols.write() = symbols;
        *self.higher_tfs.write() = higher;
        *self.last_boundary.lock() = boundaries;
    }

    /// Spawn the consumer loop over the base-timeframe close pattern.
    pub async fn start(self: Arc<Self>) {
        let pattern = self.scope.candle_close_pattern(self.base_tf);
        let mut sub = match self.cache.subscribe(&[pattern.clone()]).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "scheduler subscribe failed");
                return;
            }
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            info!(pattern = %pattern, "indicator scheduler listening");
            while let Some(msg) = sub.recv().await {
                match serde_json::from_str::<Candle>(&msg.payload) {
                    Ok(candle) => this.handle_close(&candle).await,
                    Err(e) => {
                        debug!(topic = %msg.topic, error = %e, "dropping unparseable candle-close")
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the consumer loop. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("indicator scheduler stopped");
        }
    }

    /// Process one base-timeframe close event.
    pub async fn handle_close(&self, candle: &Candle) {
        if !self.symbols.read().contains(&candle.symbol) {
            debug!(symbol = %candle.symbol, "dropping close for unmonitored symbol");
            return;
        }

        // Base timeframe first, straight from the cache.
        self.recompute_from_cache(&candle.symbol, self.base_tf).await;

        // Higher timeframes on their bucket boundaries.
        let tfs = self
            .higher_tfs
            .read()
            .get(&candle.symbol)
            .cloned()
            .unwrap_or_default();

        for tf in tfs {
            let current = tf.bucket(candle.timestamp);
            let advanced = {
                let mut boundaries = self.last_boundary.lock();
                let entry = boundaries
                    .entry((candle.symbol.clone(), tf))
                    .or_insert(current);
                if current > *entry {
                    *entry = current;
                    true
                } else {
                    false
                }
            };
            if !advanced {
                continue;
            }

            match self.derivation {
                Derivation::CacheRead => self.recompute_from_cache(&candle.symbol, tf).await,
                Derivation::Aggregate => self.recompute_by_aggregation(&candle.symbol, tf).await,
            }
        }
    }

    /// Recompute one (symbol, timeframe) immediately, bypassing the boundary
    /// gate. Used by force-backfill and symbol-add flows.
    pub async fn force_recalculate(&self, symbol: &str, tf: Timeframe) {
        if tf == self.base_tf || self.derivation == Derivation::CacheRead {
            self.recompute_from_cache(symbol, tf).await;
        } else {
            self.recompute_by_aggregation(symbol, tf).await;
        }
    }

    // ── Recompute paths ─────────────────────────────────────────────────

    async fn recompute_from_cache(&self, symbol: &str, tf: Timeframe) {
        let bars = match self.candles.recent_candles(symbol, tf, READ_WINDOW).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, tf = %tf, error = %e, "candle read failed");
                return;
            }
        };
        self.compute_and_publish(symbol, tf, bars).await;
    }

    async fn recompute_by_aggregation(&self, symbol: &str, tf: Timeframe) {
        // Enough base bars to cover READ_WINDOW buckets, capped by the store
        // bound anyway.
        let per_bucket = (tf.ms() / self.base_tf.ms()) as usize;
        let needed = (READ_WINDOW * per_bucket).min(CANDLE_BOUND);

        let base_bars = match self
            .candles
            .recent_candles(symbol, self.base_tf, needed)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, tf = %tf, error = %e, "base candle read failed");
                return;
            }
        };

        let bars = aggregate_bars(&base_bars, self.base_tf, tf);
        self.compute_and_publish(symbol, tf, bars).await;
    }

    async fn compute_and_publish(&self, symbol: &str, tf: Timeframe, bars: Vec<Candle>) {
        if bars.len() < READY_BARS {
            debug!(
                symbol,
                tf = %tf,
                bars = bars.len(),
                "skipping recompute below readiness gate"
            );
            return;
        }

        let filled = fill_gaps(&bars, tf);
        let zero_range = zero_range_ratio(&filled.candles);
        let output = macd_v::compute(&filled.candles);

        let Some(value) = output.value else {
            debug!(
                symbol,
                tf = %tf,
                reason = output.reason.as_deref().unwrap_or("unknown"),
                "indicator value unavailable"
            );
            return;
        };
        let Some(last) = filled.candles.last() else {
            return;
        };

        let indicator = IndicatorValue {
            timestamp: last.timestamp,
            indicator_type: INDICATOR_MACD_V.to_string(),
            symbol: symbol.to_string(),
            timeframe: tf,
            value,
            params: IndicatorParams {
                fast_period: FAST_PERIOD,
                slow_period: SLOW_PERIOD,
                atr_period: ATR_PERIOD,
                signal_period: SIGNAL_PERIOD,
                stage: output.stage,
                liquidity: liquidity_grade(filled.stats.gap_ratio),
                gap_ratio: filled.stats.gap_ratio,
                zero_range_ratio: zero_range,
                seeded: output.seeded,
                n_eff: output.n_eff,
                span_bars: output.span_bars,
                reason: output.reason,
            },
        };

        // Write and publish are each attempted regardless of the other.
        if let Err(e) = self.indicators.set(&indicator).await {
            warn!(symbol, tf = %tf, error = %e, "indicator write failed");
        }
        if let Err(e) = self.indicators.publish(&indicator).await {
            warn!(symbol, tf = %tf, error = %e, "indicator publish failed");
        }
    }
}

// =============================================================================
// Local aggregation
// =============================================================================

/// Merge base-timeframe bars into `target` buckets:
/// `open = first.open, close = last.close, high = max, low = min,
/// volume = sum`. A trailing bucket that extends past the observed data is
/// dropped — only completed buckets produce bars.
pub fn aggregate_bars(base: &[Candle], base_tf: Timeframe, target: Timeframe) -> Vec<Candle> {
    let Some(last) = base.last() else {
        return Vec::new();
    };
    let observed_end = last.timestamp + base_tf.ms();

    let mut out: Vec<Candle> = Vec::new();
    for bar in base {
        let bucket = target.bucket(bar.timestamp);
        match out.last_mut() {
            Some(current) if current.timestamp == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => {
                out.push(Candle {
                    timestamp: bucket,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    symbol: bar.symbol.clone(),
                    timeframe: target,
                    is_synthetic: false,
                });
            }
        }
    }

    // Drop the partial trailing bucket.
    if let Some(tail) = out.last() {
        if tail.timestamp + target.ms() > observed_end {
            out.pop();
        }
    }
    out
}
