// =============================================================================
// Alert evaluator — level crossings & reversals over the indicator stream
// =============================================================================
//
// Subscribes to every monitored (symbol, ticker) and (symbol, timeframe,
// macd-v) topic and runs a per-(symbol, timeframe) state machine:
//
//   - level crossings, deepest/highest level wins, per-level cooldown
//   - signal-line reversals out of the extreme zones, with asymmetric
//     buffers and one alert per excursion
//
// All cooldown and reversal-flag mutations happen BEFORE the first await on
// the renderer / notifier / store, so concurrent updates cannot race a
// duplicate emission. Every map is touched only from this evaluator's own
// message loop.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::bias::compute_bias;
use crate::alerts::{AlertAnnouncement, AlertTrigger, Direction, Zone, ALERT_TYPE_MACDV};
use crate::cache::strategies::{CandleStore, IndicatorStore};
use crate::cache::CacheService;
use crate::cache_keys::{alert_channel, Scope};
use crate::errors::EngineError;
use crate::notifier::{AlertEmbed, EmbedField, Notifier};
use crate::renderer::{ChartRenderer, ChartRequest};
use crate::settings::IndicatorConfig;
use crate::store::PersistentStore;
use crate::timeframe::Timeframe;
use crate::types::{AlertRecord, IndicatorValue, Ticker, INDICATOR_MACD_V};

/// Minimum wall-clock interval between two alerts with the same identity.
pub const COOLDOWN_MS: i64 = 300_000;

pub const OVERSOLD_LEVELS: [i32; 6] = [-150, -200, -250, -300, -350, -400];
pub const OVERBOUGHT_LEVELS: [i32; 6] = [150, 200, 250, 300, 350, 400];

/// Reversal confirmation buffers, as a fraction of |MACD-V|. Exits from
/// oversold demand a stronger histogram push than exits from overbought.
pub const OVERSOLD_BUFFER_PCT: f64 = 0.05;
pub const OVERBOUGHT_BUFFER_PCT: f64 = 0.03;

pub const CHART_TIMEOUT_MS: u64 = 3_000;

/// Bars fetched for the chart request / shown on it.
const CHART_BARS: usize = 120;
const CHART_DISPLAY_BARS: usize = 60;

pub struct AlertEvaluator {
    cache: Arc<dyn CacheService>,
    candles: Arc<CandleStore>,
    indicators: Arc<IndicatorStore>,
    store: Arc<dyn PersistentStore>,
    notifier: Arc<dyn Notifier>,
    renderer: Arc<dyn ChartRenderer>,

    scope: Scope,
    exchange_name: String,
    configs: RwLock<Vec<IndicatorConfig>>,

    // ── Per-(symbol, timeframe) state, keyed "{symbol}:{tf}" ────────────
    previous_macd_v: Mutex<HashMap<String, f64>>,
    /// "{key}:{level}" -> last alert epoch ms.
    alerted_levels: Mutex<HashMap<String, i64>>,
    /// "{key}:reversal" -> last reversal epoch ms.
    reversal_cooldown: Mutex<HashMap<String, i64>>,
    /// One reversal alert per extreme excursion.
    in_reversal_state: Mutex<HashMap<String, bool>>,
    /// Latest trade price per symbol, from the ticker stream.
    current_prices: Mutex<HashMap<String, f64>>,
    /// Last emitted trigger label per key (becomes `previous_label`).
    last_labels: Mutex<HashMap<String, String>>,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AlertEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn CacheService>,
        candles: Arc<CandleStore>,
        indicators: Arc<IndicatorStore>,
        store: Arc<dyn PersistentStore>,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn ChartRenderer>,
        scope: Scope,
        exchange_name: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            candles,
            indicators,
            store,
            notifier,
            renderer,
            scope,
            exchange_name: exchange_name.into(),
            configs: RwLock::new(Vec::new()),
            previous_macd_v: Mutex::new(HashMap::new()),
            alerted_levels: Mutex::new(HashMap::new()),
            reversal_cooldown: Mutex::new(HashMap::new()),
            in_reversal_state: Mutex::new(HashMap::new()),
            current_prices: Mutex::new(HashMap::new()),
            last_labels: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        }
    }

    /// Replace the monitored (symbol, timeframe) grid. Takes effect for
    /// context fetches immediately; the subscription set updates on the next
    /// start.
    pub fn configure(&self, configs: &[IndicatorConfig]) {
        *self.configs.write() = configs.to_vec();
    }

    /// Subscribe to every monitored ticker and indicator topic and spawn the
    /// message loop.
    pub async fn start(self: Arc<Self>) {
        let configs = self.configs.read().clone();

        let mut patterns: Vec<String> = Vec::new();
        let mut symbols: HashSet<String> = HashSet::new();
        for cfg in &configs {
            symbols.insert(cfg.symbol.clone());
            patterns.push(
                self.scope
                    .indicator_channel(&cfg.symbol, cfg.timeframe, INDICATOR_MACD_V),
            );
        }
        for symbol in &symbols {
            patterns.push(self.scope.ticker_channel(symbol));
        }

        let mut sub = match self.cache.subscribe(&patterns).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "alert evaluator subscribe failed");
                return;
            }
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            info!(
                symbols = symbols.len(),
                topics = patterns.len(),
                "alert evaluator listening"
            );
            while let Some(msg) = sub.recv().await {
                if msg.topic.starts_with("channel:ticker:") {
                    match serde_json::from_str::<Ticker>(&msg.payload) {
                        Ok(ticker) => this.on_ticker(&ticker),
                        Err(e) => debug!(topic = %msg.topic, error = %e, "dropping bad ticker"),
                    }
                } else {
                    match serde_json::from_str::<IndicatorValue>(&msg.payload) {
                        Ok(value) => {
                            this.handle_indicator(&value).await;
                        }
                        Err(e) => debug!(topic = %msg.topic, error = %e, "dropping bad indicator"),
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Detach from the message stream, then wipe all in-memory state.
    pub fn stop(&self) {
        // Listener first — no handler may run during teardown.
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.previous_macd_v.lock().clear();
        self.alerted_levels.lock().clear();
        self.reversal_cooldown.lock().clear();
        self.in_reversal_state.lock().clear();
        self.current_prices.lock().clear();
        self.last_labels.lock().clear();
        info!("alert evaluator stopped");
    }

    /// Latest known trade price for a symbol.
    pub fn current_price(&self, symbol: &str) -> Option<f64> {
        self.current_prices.lock().get(symbol).copied()
    }

    /// The stored previous MACD-V for a (symbol, timeframe).
    pub fn previous_value(&self, symbol: &str, tf: Timeframe) -> Option<f64> {
        self.previous_macd_v
            .lock()
            .get(&format!("{symbol}:{tf}"))
            .copied()
    }

    fn on_ticker(&self, ticker: &Ticker) {
        self.current_prices
            .lock()
            .insert(ticker.symbol.clone(), ticker.price);
    }

    /// Evaluate one indicator update at the current wall clock.
    pub async fn handle_indicator(&self, value: &IndicatorValue) -> Vec<AlertTrigger> {
        self.handle_indicator_at(value, Utc::now().timestamp_millis())
            .await
    }

    /// Evaluate one indicator update at an explicit `now` (ms). Returns the
    /// triggers that fired.
    pub async fn handle_indicator_at(
        &self,
        value: &IndicatorValue,
        now_ms: i64,
    ) -> Vec<AlertTrigger> {
        let macd_v = value.value.macd_v;
        if !macd_v.is_finite() {
            let err = EngineError::DataInvalid(format!(
                "non-finite macd-v for {}:{}",
                value.symbol, value.timeframe
            ));
            debug!(error = %err, "dropping indicator sample");
            return Vec::new();
        }

        let key = format!("{}:{}", value.symbol, value.timeframe);
        let prev = self.previous_macd_v.lock().insert(key.clone(), macd_v);
        let Some(prev) = prev else {
            // First sample for this key: nothing to compare against.
            return Vec::new();
        };
        let histogram = value.value.histogram;

        let mut triggers: Vec<AlertTrigger> = Vec::new();

        // ── Level crossing, downward: deepest crossed level wins ────────
        let mut crossed_down: Option<i32> = None;
        for &level in &OVERSOLD_LEVELS {
            if prev >= level as f64 && macd_v < level as f64 {
                crossed_down = Some(crossed_down.map_or(level, |d| d.min(level)));
            }
        }
        if let Some(level) = crossed_down {
            if self.level_cooldown_elapsed(&key, level, now_ms) {
                self.alerted_levels
                    .lock()
                    .insert(format!("{key}:{level}"), now_ms);
                self.in_reversal_state.lock().insert(key.clone(), false);
                triggers.push(AlertTrigger::LevelCross {
                    level,
                    direction: Direction::Down,
                });
            }
        }

        // ── Level crossing, upward: highest crossed level wins ──────────
        let mut crossed_up: Option<i32> = None;
        for &level in &OVERBOUGHT_LEVELS {
            if prev <= level as f64 && macd_v > level as f64 {
                crossed_up = Some(crossed_up.map_or(level, |u| u.max(level)));
            }
        }
        if let Some(level) = crossed_up {
            if self.level_cooldown_elapsed(&key, level, now_ms) {
                self.alerted_levels
                    .lock()
                    .insert(format!("{key}:{level}"), now_ms);
                self.in_reversal_state.lock().insert(key.clone(), false);
                triggers.push(AlertTrigger::LevelCross {
                    level,
                    direction: Direction::Up,
                });
            }
        }

        // ── Reversal out of oversold ────────────────────────────────────
        // Both readings must already be in the zone; a bar that ENTERS the
        // zone this tick cannot also reverse out of it.
        if macd_v < -150.0 && prev < -150.0 {
            let buffer = macd_v.abs() * OVERSOLD_BUFFER_PCT;
            if histogram > buffer
                && !self.reversal_flag(&key)
                && self.reversal_cooldown_elapsed(&key, now_ms)
            {
                self.reversal_cooldown
                    .lock()
                    .insert(format!("{key}:reversal"), now_ms);
                self.in_reversal_state.lock().insert(key.clone(), true);
                triggers.push(AlertTrigger::Reversal {
                    zone: Zone::Oversold,
                });
            }
        }

        // ── Reversal out of overbought ──────────────────────────────────
        if macd_v > 150.0 && prev > 150.0 {
            let buffer = macd_v.abs() * OVERBOUGHT_BUFFER_PCT;
            if histogram < -buffer
                && !self.reversal_flag(&key)
                && self.reversal_cooldown_elapsed(&key, now_ms)
            {
                self.reversal_cooldown
                    .lock()
                    .insert(format!("{key}:reversal"), now_ms);
                self.in_reversal_state.lock().insert(key.clone(), true);
                triggers.push(AlertTrigger::Reversal {
                    zone: Zone::Overbought,
                });
            }
        }

        // State is settled — only now do we touch the slow collaborators.
        for trigger in &triggers {
            self.emit(value, *trigger, prev, now_ms).await;
        }
        triggers
    }

    fn level_cooldown_elapsed(&self, key: &str, level: i32, now_ms: i64) -> bool {
        self.alerted_levels
            .lock()
            .get(&format!("{key}:{level}"))
            .map_or(true, |&last| now_ms - last >= COOLDOWN_MS)
    }

    fn reversal_cooldown_elapsed(&self, key: &str, now_ms: i64) -> bool {
        self.reversal_cooldown
            .lock()
            .get(&format!("{key}:reversal"))
            .map_or(true, |&last| now_ms - last >= COOLDOWN_MS)
    }

    fn reversal_flag(&self, key: &str) -> bool {
        self.in_reversal_state
            .lock()
            .get(key)
            .copied()
            .unwrap_or(false)
    }

    // ── Emission pipeline ───────────────────────────────────────────────

    async fn emit(
        &self,
        value: &IndicatorValue,
        trigger: AlertTrigger,
        prev_macd_v: f64,
        now_ms: i64,
    ) {
        let symbol = value.symbol.clone();
        let tf = value.timeframe;
        let key = format!("{symbol}:{tf}");
        let label = trigger.label();
        let previous_label = self.last_labels.lock().insert(key, label.clone());

        // Multi-timeframe context in one backend round-trip.
        let requests: Vec<(String, Timeframe)> = self
            .configs
            .read()
            .iter()
            .filter(|c| c.symbol == symbol)
            .map(|c| (c.symbol.clone(), c.timeframe))
            .collect();
        let context = match self.indicators.get_bulk(&requests, INDICATOR_MACD_V).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "context fetch failed, alerting without it");
                HashMap::new()
            }
        };
        let bias = compute_bias(&context);

        let price = self
            .current_prices
            .lock()
            .get(&symbol)
            .copied()
            .unwrap_or(0.0);

        // Chart: bounded wait, degrade gracefully.
        let chart_candles = self
            .candles
            .recent_candles(&symbol, tf, CHART_BARS)
            .await
            .unwrap_or_default();
        let chart_request = ChartRequest {
            symbol: symbol.clone(),
            timeframe: tf,
            candles: chart_candles,
            trigger_label: label.clone(),
            display_bars: CHART_DISPLAY_BARS,
        };
        let image = match tokio::time::timeout(
            Duration::from_millis(CHART_TIMEOUT_MS),
            self.renderer.render_macd_v_chart(&chart_request),
        )
        .await
        {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                debug!(symbol = %symbol, error = %e, "chart render failed");
                None
            }
            Err(_) => {
                debug!(symbol = %symbol, "chart render timed out");
                None
            }
        };
        let chart_generated = image.is_some();

        // Notify, best-effort.
        let embed = self.build_embed(value, &trigger, price, bias.label, now_ms);
        let (notification_sent, notification_error) =
            match self.notifier.send_alert(&embed, image.as_deref()).await {
                Ok(()) => (true, None),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "alert notification failed");
                    (false, Some(e.to_string()))
                }
            };

        let triggered_at = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);

        let context_stages: HashMap<String, String> = context
            .iter()
            .map(|(k, v)| (k.clone(), v.params.stage.to_string()))
            .collect();
        let details = serde_json::json!({
            "previousMacdV": prev_macd_v,
            "macdV": value.value.macd_v,
            "signal": value.value.signal,
            "histogram": value.value.histogram,
            "stage": value.params.stage.to_string(),
            "bias": {
                "label": bias.label,
                "bullishScore": bias.bullish_score,
                "bearishScore": bias.bearish_score,
            },
            "context": context_stages,
        });

        let record = AlertRecord {
            id: Uuid::new_v4().to_string(),
            exchange_id: self.scope.exchange.clone(),
            symbol: symbol.clone(),
            timeframe: tf,
            alert_type: ALERT_TYPE_MACDV.to_string(),
            triggered_at,
            price,
            trigger_value: value.value.macd_v,
            trigger_label: label.clone(),
            previous_label,
            details,
            chart_generated,
            notification_sent,
            notification_error,
        };

        let alert_id = match self.store.insert_alert(&record).await {
            Ok(id) => id,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "alert persistence failed");
                record.id.clone()
            }
        };

        // Cross-exchange announce.
        let announcement = AlertAnnouncement {
            id: alert_id,
            symbol: symbol.clone(),
            alert_type: ALERT_TYPE_MACDV.to_string(),
            timeframe: tf,
            price,
            trigger_value: value.value.macd_v,
            signal_delta: value.value.histogram,
            triggered_at,
            source_exchange_id: self.scope.exchange.clone(),
            source_exchange_name: self.exchange_name.clone(),
            trigger_label: label.clone(),
        };
        match serde_json::to_string(&announcement) {
            Ok(payload) => {
                if let Err(e) = self
                    .cache
                    .publish(&alert_channel(&self.scope.exchange), &payload)
                    .await
                {
                    warn!(symbol = %symbol, error = %e, "alert publish failed");
                }
            }
            Err(e) => warn!(error = %e, "alert announcement encode failed"),
        }

        info!(
            symbol = %symbol,
            tf = %tf,
            label = %label,
            macd_v = value.value.macd_v,
            bias = bias.label,
            sent = notification_sent,
            "alert emitted"
        );
    }

    fn build_embed(
        &self,
        value: &IndicatorValue,
        trigger: &AlertTrigger,
        price: f64,
        bias_label: &str,
        now_ms: i64,
    ) -> AlertEmbed {
        let (title, color) = match trigger {
            AlertTrigger::LevelCross {
                level,
                direction: Direction::Down,
            } => (
                format!("{} {} crossed below {}", value.symbol, value.timeframe, level),
                0xE74C3C,
            ),
            AlertTrigger::LevelCross {
                level,
                direction: Direction::Up,
            } => (
                format!("{} {} crossed above {}", value.symbol, value.timeframe, level),
                0x2ECC71,
            ),
            AlertTrigger::Reversal {
                zone: Zone::Oversold,
            } => (
                format!("{} {} reversal from oversold", value.symbol, value.timeframe),
                0x3498DB,
            ),
            AlertTrigger::Reversal {
                zone: Zone::Overbought,
            } => (
                format!(
                    "{} {} reversal from overbought",
                    value.symbol, value.timeframe
                ),
                0xE67E22,
            ),
        };

        AlertEmbed {
            title,
            description: format!(
                "MACD-V {:.1} | signal {:.1} | histogram {:+.1} | stage {}",
                value.value.macd_v,
                value.value.signal,
                value.value.histogram,
                value.params.stage
            ),
            color,
            fields: vec![
                EmbedField {
                    name: "Price".into(),
                    value: format!("{price}"),
                    inline: true,
                },
                EmbedField {
                    name: "Bias".into(),
                    value: bias_label.to_string(),
                    inline: true,
                },
                EmbedField {
                    name: "Exchange".into(),
                    value: self.exchange_name.clone(),
                    inline: true,
                },
            ],
            timestamp: Utc
                .timestamp_millis_opt(now_ms)
                .single()
                .unwrap_or_else(Utc::now),
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
    use crate::renderer::NullRenderer;
    use crate::settings::UserSettings;
    use crate::types::{IndicatorParams, Liquidity, MacdVValue, Stage};
    use async_trait::async_trait;

    // ── Test doubles ────────────────────────────────────────────────────

    struct RecordingNotifier {
        sent: Mutex<Vec<AlertEmbed>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn new(fail: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_alert(
            &self,
            embed: &AlertEmbed,
            _image_png: Option<&[u8]>,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("webhook unreachable");
            }
            self.sent.lock().push(embed.clone());
            Ok(())
        }
    }

    struct MemStore {
        alerts: Mutex<Vec<AlertRecord>>,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                alerts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PersistentStore for MemStore {
        async fn insert_alert(&self, record: &AlertRecord) -> anyhow::Result<String> {
            self.alerts.lock().push(record.clone());
            Ok(record.id.clone())
        }
        async fn load_settings(&self, _sub: &str) -> anyhow::Result<Option<UserSettings>> {
            Ok(None)
        }
        async fn save_settings(&self, _sub: &str, _s: &UserSettings) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        evaluator: Arc<AlertEvaluator>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemStore>,
        cache: Arc<dyn CacheService>,
    }

    fn fixture_with(fail_notifier: bool) -> Fixture {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let scope = Scope::new("u", "coinbase");
        let candles = Arc::new(CandleStore::new(cache.clone(), scope.clone()));
        let indicators = Arc::new(IndicatorStore::new(cache.clone(), scope.clone()));
        let notifier = Arc::new(RecordingNotifier::new(fail_notifier));
        let store = Arc::new(MemStore::new());

        let evaluator = Arc::new(AlertEvaluator::new(
            cache.clone(),
            candles,
            indicators,
            store.clone(),
            notifier.clone(),
            Arc::new(NullRenderer),
            scope,
            "Coinbase",
        ));
        evaluator.configure(&[
            IndicatorConfig {
                symbol: "BTC-USD".into(),
                timeframe: Timeframe::M5,
            },
            IndicatorConfig {
                symbol: "BTC-USD".into(),
                timeframe: Timeframe::H1,
            },
        ]);

        Fixture {
            evaluator,
            notifier,
            store,
            cache,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn indicator(macd_v: f64, histogram: f64) -> IndicatorValue {
        IndicatorValue {
            timestamp: 0,
            indicator_type: INDICATOR_MACD_V.into(),
            symbol: "BTC-USD".into(),
            timeframe: Timeframe::M5,
            value: MacdVValue {
                macd_v,
                signal: macd_v - histogram,
                histogram,
                fast_ema: 0.0,
                slow_ema: 0.0,
                atr: 1.0,
            },
            params: IndicatorParams {
                fast_period: 12,
                slow_period: 26,
                atr_period: 26,
                signal_period: 9,
                stage: Stage::Oversold,
                liquidity: Liquidity::A,
                gap_ratio: 0.0,
                zero_range_ratio: 0.0,
                seeded: true,
                n_eff: 60,
                span_bars: 60,
                reason: None,
            },
        }
    }

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn first_sample_never_alerts() {
        let f = fixture();
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0)
            .await;
        assert!(fired.is_empty());
        assert_eq!(
            f.evaluator.previous_value("BTC-USD", Timeframe::M5),
            Some(-260.0)
        );
    }

    #[tokio::test]
    async fn deepest_crossed_level_wins() {
        // prev -140, current -260 crosses -150/-200/-250 in one move;
        // only the deepest fires.
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;

        assert_eq!(
            fired,
            vec![AlertTrigger::LevelCross {
                level: -250,
                direction: Direction::Down,
            }]
        );

        let alerts = f.store.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].trigger_label, "level_-250");
        assert!(alerts[0].notification_sent);
        assert!(!f.evaluator.reversal_flag("BTC-USD:5m"));
    }

    #[tokio::test]
    async fn no_retrigger_without_recrossing() {
        // -260 -> -270 crosses nothing new.
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-270.0, -4.0), T0 + 2_000)
            .await;
        assert!(fired.is_empty());
        assert_eq!(f.store.alerts.lock().len(), 1);
    }

    #[tokio::test]
    async fn level_cooldown_blocks_then_releases() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;
        // Bounce above the level, then cross again inside the cooldown.
        f.evaluator
            .handle_indicator_at(&indicator(-240.0, 3.0), T0 + 2_000)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-255.0, -2.0), T0 + 3_000)
            .await;
        assert!(fired.is_empty(), "cooldown must suppress the re-cross");

        // Same dance after the cooldown expires.
        f.evaluator
            .handle_indicator_at(&indicator(-240.0, 3.0), T0 + COOLDOWN_MS + 2_000)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-255.0, -2.0), T0 + COOLDOWN_MS + 3_000)
            .await;
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn reversal_from_oversold_needs_buffer() {
        // prev -260, current -255, histogram +13 beats the
        // 12.75 buffer.
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -1.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-255.0, 13.0), T0 + 1_000)
            .await;
        assert_eq!(
            fired,
            vec![AlertTrigger::Reversal {
                zone: Zone::Oversold,
            }]
        );
        assert!(f.evaluator.reversal_flag("BTC-USD:5m"));
        assert_eq!(f.store.alerts.lock()[0].trigger_label, "reversal_oversold");
    }

    #[tokio::test]
    async fn reversal_below_buffer_stays_quiet() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -1.0), T0)
            .await;
        // Buffer is 255 * 0.05 = 12.75; 12.0 is not enough.
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-255.0, 12.0), T0 + 1_000)
            .await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn one_reversal_per_excursion() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -1.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-255.0, 13.0), T0 + 1_000)
            .await;
        // Still in the zone with a strong histogram — flag suppresses.
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-250.0, 14.0), T0 + COOLDOWN_MS + 2_000)
            .await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn level_cross_rearms_reversal() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -1.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-255.0, 13.0), T0 + 1_000)
            .await;
        assert!(f.evaluator.reversal_flag("BTC-USD:5m"));

        // A fresh level crossing clears the flag.
        let t = T0 + COOLDOWN_MS + 10_000;
        f.evaluator
            .handle_indicator_at(&indicator(-240.0, 5.0), t)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-260.0, -2.0), t + 1_000)
            .await;
        assert_eq!(fired.len(), 1);
        assert!(!f.evaluator.reversal_flag("BTC-USD:5m"));
    }

    #[tokio::test]
    async fn entry_tick_cannot_also_reverse() {
        // prev -120, current -160, histogram +2. The level
        // alert fires; the reversal must not (prev was outside the zone).
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-120.0, 0.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-160.0, 2.0), T0 + 1_000)
            .await;
        assert_eq!(
            fired,
            vec![AlertTrigger::LevelCross {
                level: -150,
                direction: Direction::Down,
            }]
        );
        assert_eq!(f.store.alerts.lock()[0].trigger_label, "level_-150");
    }

    #[tokio::test]
    async fn overbought_reversal_uses_tighter_buffer() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(260.0, 1.0), T0)
            .await;
        // Buffer is 255 * 0.03 = 7.65; -8 clears it.
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(255.0, -8.0), T0 + 1_000)
            .await;
        assert_eq!(
            fired,
            vec![AlertTrigger::Reversal {
                zone: Zone::Overbought,
            }]
        );
        assert_eq!(
            f.store.alerts.lock()[0].trigger_label,
            "reversal_overbought"
        );
    }

    #[tokio::test]
    async fn upward_cross_picks_highest_level() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(140.0, 1.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(230.0, 4.0), T0 + 1_000)
            .await;
        assert_eq!(
            fired,
            vec![AlertTrigger::LevelCross {
                level: 200,
                direction: Direction::Up,
            }]
        );
    }

    #[tokio::test]
    async fn nan_macd_v_is_dropped() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(f64::NAN, 0.0), T0 + 1_000)
            .await;
        assert!(fired.is_empty());
        // The NaN did not clobber the previous value.
        assert_eq!(
            f.evaluator.previous_value("BTC-USD", Timeframe::M5),
            Some(-140.0)
        );
    }

    #[tokio::test]
    async fn record_captures_price_and_announcement_is_published() {
        let f = fixture();
        let mut sub = f.cache.subscribe(&["channel:alert:coinbase".into()]).await.unwrap();

        f.evaluator.on_ticker(&Ticker {
            symbol: "BTC-USD".into(),
            price: 64_250.5,
            change_24h: 0.0,
            change_pct_24h: 0.0,
            volume_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            timestamp: T0,
        });
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;

        let alerts = f.store.alerts.lock();
        assert!((alerts[0].price - 64_250.5).abs() < f64::EPSILON);
        assert_eq!(alerts[0].exchange_id, "coinbase");
        drop(alerts);

        let msg = sub.recv().await.expect("announcement");
        let announced: AlertAnnouncement = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(announced.trigger_label, "level_-250");
        assert_eq!(announced.source_exchange_name, "Coinbase");
        assert!((announced.signal_delta - -5.0).abs() < f64::EPSILON);

        // One embed went out.
        assert_eq!(f.notifier.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn notifier_failure_is_recorded_not_raised() {
        let f = fixture_with(true);
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        let fired = f
            .evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;
        assert_eq!(fired.len(), 1);

        let alerts = f.store.alerts.lock();
        assert!(!alerts[0].notification_sent);
        assert!(alerts[0]
            .notification_error
            .as_deref()
            .unwrap_or_default()
            .contains("webhook unreachable"));
    }

    #[tokio::test]
    async fn previous_label_links_consecutive_alerts() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-255.0, 13.0), T0 + 2_000)
            .await;

        let alerts = f.store.alerts.lock();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].previous_label, None);
        assert_eq!(alerts[1].previous_label.as_deref(), Some("level_-250"));
    }

    #[tokio::test]
    async fn stop_clears_all_state() {
        let f = fixture();
        f.evaluator
            .handle_indicator_at(&indicator(-140.0, 0.0), T0)
            .await;
        f.evaluator
            .handle_indicator_at(&indicator(-260.0, -5.0), T0 + 1_000)
            .await;
        f.evaluator.stop();

        assert_eq!(f.evaluator.previous_value("BTC-USD", Timeframe::M5), None);
        assert!(!f.evaluator.reversal_flag("BTC-USD:5m"));
        assert_eq!(f.evaluator.current_price("BTC-USD"), None);
    }
}
