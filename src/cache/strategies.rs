// =============================================================================
// Cache strategies — typed access patterns over the cache service
// =============================================================================
//
// Three stores (candles, indicators, tickers) plus their publish helpers.
// Members are JSON; a member that fails to parse on the way out is skipped
// with a debug log rather than failing the whole read.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheError, CacheResult, CacheService, ScoredMember, SetMode};
use crate::cache_keys::Scope;
use crate::timeframe::Timeframe;
use crate::types::{Candle, IndicatorValue, Ticker};

/// Hard bound on retained candles per (symbol, timeframe): the 60-bar
/// readiness gate plus indicator warm-up fits comfortably below this.
pub const CANDLE_BOUND: usize = 500;

/// Keys per delete round-trip. Sweeps stay sharded-deployment safe by never
/// issuing one huge delete.
pub const DELETE_BATCH: usize = 100;

fn encode<T: serde::Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Operation(format!("encode: {e}")))
}

// =============================================================================
// CandleStore — bounded ordered candle series
// =============================================================================

/// Ordered candle store keyed by `(user, exchange, symbol, timeframe)` with
/// score = bar timestamp.
pub struct CandleStore {
    cache: Arc<dyn CacheService>,
    scope: Scope,
}

impl CandleStore {
    pub fn new(cache: Arc<dyn CacheService>, scope: Scope) -> Self {
        Self { cache, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Insert candles, idempotent by timestamp: an existing bar at the same
    /// timestamp is replaced, never duplicated. Trims each touched series to
    /// [`CANDLE_BOUND`], evicting oldest first.
    pub async fn add_candles(&self, candles: &[Candle]) -> CacheResult<usize> {
        let mut groups: HashMap<(String, Timeframe), Vec<&Candle>> = HashMap::new();
        for c in candles {
            groups
                .entry((c.symbol.clone(), c.timeframe))
                .or_default()
                .push(c);
        }

        let mut added = 0;
        for ((symbol, tf), group) in groups {
            let key = self.scope.candles_key(&symbol, tf);
            let timestamps: Vec<i64> = group.iter().map(|c| c.timestamp).collect();
            let mut entries = Vec::with_capacity(group.len());
            for c in &group {
                entries.push(ScoredMember::new(c.timestamp, encode(c)?));
            }

            self.cache.sorted_remove_by_score(&key, &timestamps).await?;
            added += self.cache.sorted_add(&key, &entries).await?;
            self.cache.sorted_trim_to(&key, CANDLE_BOUND).await?;
        }
        Ok(added)
    }

    /// The most recent `count` candles, oldest first.
    pub async fn recent_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        count: usize,
    ) -> CacheResult<Vec<Candle>> {
        let key = self.scope.candles_key(symbol, tf);
        let tail = self.cache.sorted_tail(&key, count).await?;

        let mut out = Vec::with_capacity(tail.len());
        for entry in tail {
            match serde_json::from_str::<Candle>(&entry.member) {
                Ok(c) => out.push(c),
                Err(e) => {
                    debug!(key = %key, score = entry.score, error = %e, "skipping unparseable candle member");
                }
            }
        }
        Ok(out)
    }

    pub async fn latest_candle(
        &self,
        symbol: &str,
        tf: Timeframe,
    ) -> CacheResult<Option<Candle>> {
        Ok(self.recent_candles(symbol, tf, 1).await?.pop())
    }

    pub async fn count(&self, symbol: &str, tf: Timeframe) -> CacheResult<usize> {
        self.cache
            .sorted_len(&self.scope.candles_key(symbol, tf))
            .await
    }

    /// Announce a closed bar on its candle-close topic.
    pub async fn publish_close(&self, candle: &Candle) -> CacheResult<usize> {
        let topic = self
            .scope
            .candle_close_channel(&candle.symbol, candle.timeframe);
        self.cache.publish(&topic, &encode(candle)?).await
    }
}

// =============================================================================
// IndicatorStore — latest value per (symbol, timeframe, type)
// =============================================================================

pub struct IndicatorStore {
    cache: Arc<dyn CacheService>,
    scope: Scope,
}

impl IndicatorStore {
    pub fn new(cache: Arc<dyn CacheService>, scope: Scope) -> Self {
        Self { cache, scope }
    }

    pub async fn set(&self, value: &IndicatorValue) -> CacheResult<()> {
        let key = self
            .scope
            .indicator_key(&value.symbol, value.timeframe, &value.indicator_type);
        self.cache
            .kv_set(&key, &encode(value)?, SetMode::WithTtl(None))
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        symbol: &str,
        tf: Timeframe,
        kind: &str,
    ) -> CacheResult<Option<IndicatorValue>> {
        let key = self.scope.indicator_key(symbol, tf, kind);
        let raw = self.cache.kv_get(&key).await?;
        Ok(raw.and_then(|s| match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key = %key, error = %e, "skipping unparseable indicator value");
                None
            }
        }))
    }

    /// Fetch many (symbol, timeframe) values of one indicator type in a
    /// single backend round-trip. Result is keyed `"{symbol}:{tf}"`; missing
    /// or unparseable entries are absent.
    pub async fn get_bulk(
        &self,
        requests: &[(String, Timeframe)],
        kind: &str,
    ) -> CacheResult<HashMap<String, IndicatorValue>> {
        let keys: Vec<String> = requests
            .iter()
            .map(|(symbol, tf)| self.scope.indicator_key(symbol, *tf, kind))
            .collect();
        let raws = self.cache.kv_get_many(&keys).await?;

        let mut out = HashMap::new();
        for ((symbol, tf), raw) in requests.iter().zip(raws) {
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<IndicatorValue>(&raw) {
                Ok(v) => {
                    out.insert(format!("{symbol}:{tf}"), v);
                }
                Err(e) => {
                    debug!(symbol = %symbol, tf = %tf, error = %e, "skipping unparseable indicator value");
                }
            }
        }
        Ok(out)
    }

    pub async fn publish(&self, value: &IndicatorValue) -> CacheResult<usize> {
        let topic =
            self.scope
                .indicator_channel(&value.symbol, value.timeframe, &value.indicator_type);
        self.cache.publish(&topic, &encode(value)?).await
    }
}

// =============================================================================
// TickerStore — latest ticker per symbol
// =============================================================================

pub struct TickerStore {
    cache: Arc<dyn CacheService>,
    scope: Scope,
}

impl TickerStore {
    pub fn new(cache: Arc<dyn CacheService>, scope: Scope) -> Self {
        Self { cache, scope }
    }

    pub async fn set(&self, ticker: &Ticker) -> CacheResult<()> {
        let key = self.scope.ticker_key(&ticker.symbol);
        self.cache
            .kv_set(&key, &encode(ticker)?, SetMode::WithTtl(None))
            .await?;
        Ok(())
    }

    pub async fn get(&self, symbol: &str) -> CacheResult<Option<Ticker>> {
        let key = self.scope.ticker_key(symbol);
        let raw = self.cache.kv_get(&key).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn publish(&self, ticker: &Ticker) -> CacheResult<usize> {
        let topic = self.scope.ticker_channel(&ticker.symbol);
        self.cache.publish(&topic, &encode(ticker)?).await
    }
}

// =============================================================================
// Batched deletion
// =============================================================================

/// Delete keys in [`DELETE_BATCH`]-sized rounds.
pub async fn delete_keys_batched(
    cache: &Arc<dyn CacheService>,
    keys: &[String],
) -> CacheResult<usize> {
    let mut removed = 0;
    for chunk in keys.chunks(DELETE_BATCH) {
        removed += cache.kv_delete(chunk).await?;
    }
    Ok(removed)
}
