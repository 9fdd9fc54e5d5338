// =============================================================================
// Binance adapter — combined WebSocket stream + HMAC-SHA256 signed REST
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift.
//
// Canonical symbols ("BTC-USD") map to exchange symbols ("BTCUSD") when a
// stream or REST path is built; inbound messages map back through the
// subscription table.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::exchange::{ExchangeAdapter, MarketEvent};
use crate::timeframe::Timeframe;
use crate::types::{Candle, Ticker};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// Reconnect delay after a dropped stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Max klines per REST request.
const KLINE_LIMIT: usize = 1_000;

pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    rest_url: String,
    ws_url: String,
    client: reqwest::Client,

    /// canonical -> exchange symbol, rebuilt on subscribe.
    symbol_map: RwLock<HashMap<String, String>>,
    connected: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::UnboundedSender<MarketEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// "BTC-USD" -> "BTCUSD" (exchange form).
fn exchange_symbol(canonical: &str) -> String {
    canonical.replace('-', "").to_uppercase()
}

impl BinanceAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            rest_url: "https://api.binance.com".to_string(),
            ws_url: "wss://stream.binance.com:9443".to_string(),
            client,
            symbol_map: RwLock::new(HashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    // ── Signing ─────────────────────────────────────────────────────────

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // ── Stream plumbing ─────────────────────────────────────────────────

    fn stream_url(&self) -> String {
        let map = self.symbol_map.read();
        let streams: Vec<String> = map
            .values()
            .map(|ex| format!("{}@ticker", ex.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.ws_url, streams.join("/"))
    }

    fn spawn_reader(&self) {
        let Some(tx) = self.events.lock().clone() else {
            return;
        };
        let url = self.stream_url();
        let connected = self.connected.clone();
        let reverse: HashMap<String, String> = self
            .symbol_map
            .read()
            .iter()
            .map(|(canonical, ex)| (ex.clone(), canonical.clone()))
            .collect();

        let handle = tokio::spawn(async move {
            while connected.load(Ordering::SeqCst) {
                if let Err(e) = run_ticker_stream(&url, &reverse, &tx).await {
                    error!(error = %e, "ticker stream error — reconnecting in 5s");
                }
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        let mut reader = self.reader.lock();
        if let Some(old) = reader.replace(handle) {
            old.abort();
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    async fn connect(&self, events: mpsc::UnboundedSender<MarketEvent>) -> Result<()> {
        *self.events.lock() = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        if self.symbol_map.read().is_empty() {
            debug!("connect with empty symbol set — stream starts on subscribe");
            return Ok(());
        }
        self.spawn_reader();
        info!("binance adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        info!("binance adapter disconnected");
    }

    async fn subscribe(&self, symbols: &[String], base_tf: Timeframe) -> Result<()> {
        {
            let mut map = self.symbol_map.write();
            map.clear();
            for canonical in symbols {
                map.insert(canonical.clone(), exchange_symbol(canonical));
            }
        }
        info!(count = symbols.len(), base = %base_tf, "subscription set updated");

        // Re-open the stream with the new set when already connected.
        if self.connected.load(Ordering::SeqCst) && !symbols.is_empty() {
            self.spawn_reader();
        }
        Ok(())
    }

    async fn get_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.rest_url,
            exchange_symbol(symbol),
            tf,
            start_ms,
            end_ms,
            KLINE_LIMIT
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines body")?;
        if !status.is_success() {
            anyhow::bail!("klines returned {status}: {body}");
        }

        let rows = body.as_array().context("klines body is not an array")?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(row, symbol, tf) {
                Ok(candle) => candles.push(candle),
                Err(e) => debug!(symbol, error = %e, "skipping malformed kline row"),
            }
        }
        Ok(candles)
    }

    async fn get_accounts(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.rest_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;
        if !status.is_success() {
            anyhow::bail!("account returned {status}: {body}");
        }
        debug!("account info retrieved");
        Ok(body)
    }

    async fn get_spot_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        let mut prices = HashMap::with_capacity(symbols.len());
        for canonical in symbols {
            let url = format!(
                "{}/api/v3/ticker/price?symbol={}",
                self.rest_url,
                exchange_symbol(canonical)
            );
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("GET /api/v3/ticker/price request failed")?;
            if !resp.status().is_success() {
                warn!(symbol = %canonical, status = %resp.status(), "spot price lookup failed");
                continue;
            }
            let body: serde_json::Value = resp.json().await.context("bad spot price body")?;
            if let Ok(price) = parse_string_f64(&body["price"], "price") {
                prices.insert(canonical.clone(), price);
            }
        }
        Ok(prices)
    }
}

// =============================================================================
// Message parsing
// =============================================================================

/// Connect to the combined ticker stream and forward events until the
/// stream drops. The caller owns reconnection.
async fn run_ticker_stream(
    url: &str,
    reverse: &HashMap<String, String>,
    tx: &mpsc::UnboundedSender<MarketEvent>,
) -> Result<()> {
    info!(url = %url, "connecting to ticker WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to ticker WebSocket")?;
    info!("ticker WebSocket connected");

    let (_write, mut read) = ws_stream.split();
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_ticker_message(&text, reverse) {
                        Ok(ticker) => {
                            if tx.send(MarketEvent::Ticker(ticker)).is_err() {
                                // Receiver gone — the engine is shutting down.
                                return Ok(());
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse ticker message"),
                    }
                }
                // Ping/Pong/Binary/Close are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(error = %e, "ticker WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("ticker WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a combined-stream 24hr ticker message.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusd@ticker",
///   "data": { "e": "24hrTicker", "s": "BTCUSD", "c": "37000.1", ... } }
/// ```
fn parse_ticker_message(text: &str, reverse: &HashMap<String, String>) -> Result<Ticker> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    // Support both the combined-stream envelope and a direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let exchange_sym = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let symbol = reverse
        .get(&exchange_sym)
        .cloned()
        .unwrap_or(exchange_sym);

    Ok(Ticker {
        symbol,
        price: parse_string_f64(&data["c"], "c")?,
        change_24h: parse_string_f64(&data["p"], "p").unwrap_or(0.0),
        change_pct_24h: parse_string_f64(&data["P"], "P").unwrap_or(0.0),
        volume_24h: parse_string_f64(&data["v"], "v").unwrap_or(0.0),
        high_24h: parse_string_f64(&data["h"], "h").unwrap_or(0.0),
        low_24h: parse_string_f64(&data["l"], "l").unwrap_or(0.0),
        timestamp: data["E"].as_i64().context("missing field E")?,
    })
}

/// Parse one REST kline row:
/// `[openTime, "o", "h", "l", "c", "v", closeTime, ...]`.
fn parse_kline_row(row: &serde_json::Value, symbol: &str, tf: Timeframe) -> Result<Candle> {
    let cols = row.as_array().context("kline row is not an array")?;
    if cols.len() < 6 {
        anyhow::bail!("kline row has {} columns, expected >= 6", cols.len());
    }
    Ok(Candle {
        timestamp: cols[0].as_i64().context("missing open time")?,
        open: parse_string_f64(&cols[1], "open")?,
        high: parse_string_f64(&cols[2], "high")?,
        low: parse_string_f64(&cols[3], "low")?,
        close: parse_string_f64(&cols[4], "close")?,
        volume: parse_string_f64(&cols[5], "volume")?,
        symbol: symbol.to_string(),
        timeframe: tf,
        is_synthetic: false,
    })
}

/// Binance sends numeric values as JSON strings in most payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
