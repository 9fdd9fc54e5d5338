// =============================================================================
// Historical backfill — REST candles into the cache
// =============================================================================
//
// Pulls history for a (symbol, timeframe) through the exchange adapter and
// lands it in the candle store. Runs off the hot path only: warm-up before
// the stream starts, the force-backfill command, and symbol adds.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::cache::strategies::CandleStore;
use crate::exchange::ExchangeAdapter;
use crate::timeframe::Timeframe;

/// Bars fetched per REST request.
const BATCH_BARS: i64 = 300;

/// Fetch the most recent `bars` candles for `(symbol, tf)` and insert them
/// into the store. Returns how many bars were written.
pub async fn backfill(
    adapter: &Arc<dyn ExchangeAdapter>,
    store: &CandleStore,
    symbol: &str,
    tf: Timeframe,
    bars: usize,
) -> Result<usize> {
    let end = tf.bucket(Utc::now().timestamp_millis());
    let start = end - bars as i64 * tf.ms();

    let mut written = 0usize;
    let mut cursor = start;
    while cursor < end {
        let batch_end = (cursor + BATCH_BARS * tf.ms()).min(end);
        let candles = adapter.get_candles(symbol, tf, cursor, batch_end).await?;
        if candles.is_empty() {
            debug!(symbol, tf = %tf, cursor, "no candles in backfill window");
        } else {
            written += store.add_candles(&candles).await.map_err(anyhow::Error::new)?;
        }
        cursor = batch_end;
    }

    info!(symbol, tf = %tf, requested = bars, written, "backfill complete");
    Ok(written)
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
    use crate::exchange::MarketEvent;
    use crate::types::Candle;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// Adapter double that serves deterministic flat candles.
    struct FakeAdapter {
        requests: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn connect(&self, _tx: mpsc::UnboundedSender<MarketEvent>) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn subscribe(&self, _symbols: &[String], _tf: Timeframe) -> Result<()> {
            Ok(())
        }
        async fn get_candles(
            &self,
            symbol: &str,
            tf: Timeframe,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<Candle>> {
            self.requests.lock().push((start_ms, end_ms));
            let mut out = Vec::new();
            let mut ts = tf.bucket(start_ms);
            while ts < end_ms {
                out.push(Candle {
                    timestamp: ts,
                    open: 10.0,
                    high: 11.0,
                    low: 9.0,
                    close: 10.5,
                    volume: 1.0,
                    symbol: symbol.to_string(),
                    timeframe: tf,
                    is_synthetic: false,
                });
                ts += tf.ms();
            }
            Ok(out)
        }
        async fn get_accounts(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn get_spot_prices(&self, _symbols: &[String]) -> Result<HashMap<String, f64>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn backfill_batches_and_stores() {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let store = CandleStore::new(cache, Scope::new("u", "ex"));
        let fake = Arc::new(FakeAdapter {
            requests: Mutex::new(Vec::new()),
        });
        let adapter: Arc<dyn ExchangeAdapter> = fake.clone();

        let written = backfill(&adapter, &store, "BTC-USD", Timeframe::M1, 450)
            .await
            .unwrap();
        // 450 bars at 300 per batch = 2 requests.
        assert_eq!(fake.requests.lock().len(), 2);
        assert!(written >= 450);

        let stored = store
            .recent_candles("BTC-USD", Timeframe::M1, 1_000)
            .await
            .unwrap();
        assert!(stored.len() >= 450);
        assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
