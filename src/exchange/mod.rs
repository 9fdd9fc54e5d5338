// =============================================================================
// Exchange adapter seam
// =============================================================================
//
// The engine never talks to an exchange directly — it consumes this trait.
// Streams deliver `MarketEvent`s over an mpsc channel handed to `connect`;
// REST covers historical candles plus the auxiliary account/price flows.
// =============================================================================

pub mod backfill;
pub mod binance;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::timeframe::Timeframe;
use crate::types::{Candle, Ticker};

/// One message surfaced by an exchange stream.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// A trade/ticker tick: latest price plus 24 h statistics.
    Ticker(Ticker),
    /// A bar the exchange closed upstream.
    CandleClose(Candle),
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Open the stream and deliver events into `events` until
    /// [`disconnect`](Self::disconnect). Reconnection is the adapter's
    /// responsibility.
    async fn connect(&self, events: mpsc::UnboundedSender<MarketEvent>) -> anyhow::Result<()>;

    /// Tear the stream down. Idempotent.
    async fn disconnect(&self);

    /// Replace the subscribed symbol set. Takes effect immediately when
    /// connected (the stream is re-opened with the new set).
    async fn subscribe(&self, symbols: &[String], base_tf: Timeframe) -> anyhow::Result<()>;

    /// Historical candles for `[start_ms, end_ms)`, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<Vec<Candle>>;

    /// Raw account payload (auxiliary flow).
    async fn get_accounts(&self) -> anyhow::Result<serde_json::Value>;

    /// Spot prices for the given symbols (auxiliary flow).
    async fn get_spot_prices(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, f64>>;
}
