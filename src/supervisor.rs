// =============================================================================
// Service supervisor — construction, wiring, ordered lifecycle
// =============================================================================
//
// Owns every subsystem and the shared runtime state (settings, paused flag).
// Boot starts services upstream-first (scheduler before the stream before
// the alert evaluator), shutdown stops them downstream-first, and every
// started component has a paired stop on every exit path. The registry
// lease is released on graceful shutdown only — a crash lets the TTL expire
// so a restart on the same host can reclaim it.
//
// The supervisor is also the command executor behind the control channel:
// pause/resume re-run the ordered stop/start, the symbol commands mutate
// settings through typed calls and re-configure the readers, and cache
// sweeps go through the batched cluster-safe delete.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::alerts::AlertEvaluator;
use crate::cache::strategies::{delete_keys_batched, CandleStore, IndicatorStore, TickerStore};
use crate::cache::CacheService;
use crate::cache_keys::Scope;
use crate::config::EnvConfig;
use crate::control::{ClearScope, Command, CommandExecutor, ControlChannel};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::{backfill, ExchangeAdapter, MarketEvent};
use crate::market_data::CandleAggregator;
use crate::notifier::Notifier;
use crate::registry::InstanceRegistry;
use crate::renderer::ChartRenderer;
use crate::scheduler::IndicatorScheduler;
use crate::settings::{normalize_symbol, Derivation, UserSettings};
use crate::state_machine::ConnectionStateMachine;
use crate::store::PersistentStore;
use crate::timeframe::Timeframe;
use crate::types::{ConnectionState, EngineMode};

/// Bars backfilled per (symbol, timeframe) during warm-up.
const WARMUP_BARS: usize = 300;

// =============================================================================
// Event pump — exchange stream into the caches
// =============================================================================

/// Consumes `MarketEvent`s from the adapter and feeds the ticker store and
/// the candle aggregator. Spawned per stream start, aborted on stop.
struct EventPump {
    settings: Arc<RwLock<UserSettings>>,
    candle_store: Arc<CandleStore>,
    ticker_store: Arc<TickerStore>,
    aggregator: Arc<CandleAggregator>,
}

impl EventPump {
    async fn handle(&self, event: MarketEvent) {
        match event {
            MarketEvent::Ticker(ticker) => {
                if !self.settings.read().symbols.contains(&ticker.symbol) {
                    return;
                }
                if let Err(e) = self.ticker_store.set(&ticker).await {
                    debug!(symbol = %ticker.symbol, error = %e, "ticker write failed");
                }
                if let Err(e) = self.ticker_store.publish(&ticker).await {
                    debug!(symbol = %ticker.symbol, error = %e, "ticker publish failed");
                }
                self.aggregator
                    .on_ticker(&ticker.symbol, ticker.price, ticker.timestamp)
                    .await;
            }
            MarketEvent::CandleClose(candle) => {
                if !self.settings.read().symbols.contains(&candle.symbol) {
                    return;
                }
                if let Err(e) = self
                    .candle_store
                    .add_candles(std::slice::from_ref(&candle))
                    .await
                {
                    warn!(symbol = %candle.symbol, error = %e, "exchange candle write failed");
                }
                if let Err(e) = self.candle_store.publish_close(&candle).await {
                    warn!(symbol = %candle.symbol, error = %e, "exchange candle publish failed");
                }
            }
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

pub struct Supervisor {
    scope: Scope,
    identity_sub: String,
    settings_path: PathBuf,

    cache: Arc<dyn CacheService>,
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn PersistentStore>,

    candle_store: Arc<CandleStore>,
    ticker_store: Arc<TickerStore>,

    aggregator: Arc<CandleAggregator>,
    scheduler: Arc<IndicatorScheduler>,
    alerts: Arc<AlertEvaluator>,
    registry: Arc<InstanceRegistry>,
    state_machine: Arc<ConnectionStateMachine>,
    activity: Arc<ActivityLog>,

    settings: Arc<RwLock<UserSettings>>,
    is_paused: AtomicBool,
    control: Mutex<Option<Arc<ControlChannel>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Construct and wire every subsystem. Nothing is started yet.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &EnvConfig,
        settings: UserSettings,
        cache: Arc<dyn CacheService>,
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn PersistentStore>,
        notifier: Arc<dyn Notifier>,
        renderer: Arc<dyn ChartRenderer>,
        hostname: String,
    ) -> Arc<Self> {
        let scope = Scope::new(&config.identity_sub, &config.exchange_id);

        let candle_store = Arc::new(CandleStore::new(cache.clone(), scope.clone()));
        let indicator_store = Arc::new(IndicatorStore::new(cache.clone(), scope.clone()));
        let ticker_store = Arc::new(TickerStore::new(cache.clone(), scope.clone()));

        let aggregator = Arc::new(CandleAggregator::new(
            candle_store.clone(),
            settings.base_timeframe,
        ));
        let scheduler = Arc::new(IndicatorScheduler::new(
            cache.clone(),
            candle_store.clone(),
            indicator_store.clone(),
            scope.clone(),
            settings.base_timeframe,
            settings.derivation,
        ));
        let alerts = Arc::new(AlertEvaluator::new(
            cache.clone(),
            candle_store.clone(),
            indicator_store,
            store.clone(),
            notifier,
            renderer,
            scope.clone(),
            config.exchange_name.clone(),
        ));
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            config.exchange_id.clone(),
            config.exchange_name.clone(),
            hostname,
        ));
        let state_machine = Arc::new(ConnectionStateMachine::new(registry.clone()));
        let activity = Arc::new(ActivityLog::new(cache.clone(), &config.exchange_id));

        Arc::new(Self {
            scope,
            identity_sub: config.identity_sub.clone(),
            settings_path: config.settings_path.clone(),
            cache,
            adapter,
            store,
            candle_store,
            ticker_store,
            aggregator,
            scheduler,
            alerts,
            registry,
            state_machine,
            activity,
            settings: Arc::new(RwLock::new(settings)),
            is_paused: AtomicBool::new(false),
            control: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_machine.current()
    }

    pub fn settings_snapshot(&self) -> UserSettings {
        self.settings.read().clone()
    }

    /// Record the instance's network identity in the status payload. Called
    /// before registration so the first lease write already carries it.
    pub async fn set_network_identity(&self, ip: Option<String>, country: Option<String>) {
        self.registry
            .update_status(move |s| {
                s.ip_address = ip;
                s.country_code = country;
            })
            .await;
    }

    // ── Boot & shutdown ─────────────────────────────────────────────────

    /// Claim the lease, warm the caches, start everything upstream-first,
    /// and go active. A lease conflict aborts before anything is started.
    pub async fn start(self: Arc<Self>) -> EngineResult<()> {
        self.registry.register().await?;
        self.registry.clone().start_heartbeat();

        self.state_machine
            .transition(ConnectionState::Starting)
            .await?;
        self.activity
            .record(ActivityEvent::StateTransition, "engine starting", None)
            .await;

        // Warm-up backfill; REST is allowed here, never on the hot path.
        self.warm_up().await;
        self.state_machine
            .transition(ConnectionState::Warming)
            .await?;

        // Configure the readers before any event can flow.
        self.reconfigure_readers();

        // Upstream first: scheduler, then the market data stream, then the
        // alert evaluator, then the control plane.
        self.scheduler.clone().start().await;
        if let Err(e) = self.start_stream().await {
            self.registry
                .record_error(format!("stream start failed: {e}"))
                .await;
            return Err(EngineError::Fatal(format!("stream start failed: {e}")));
        }
        self.alerts.clone().start().await;

        let control = Arc::new(ControlChannel::new(
            self.cache.clone(),
            self.clone() as Arc<dyn CommandExecutor>,
            &self.identity_sub,
        ));
        control.clone().start().await;
        *self.control.lock() = Some(control);

        self.state_machine
            .transition(ConnectionState::Active)
            .await?;
        let symbol_count = self.settings.read().symbols.len();
        self.registry
            .update_status(|s| s.symbol_count = symbol_count)
            .await;
        self.activity
            .record(ActivityEvent::StateTransition, "engine active", None)
            .await;
        info!(symbols = symbol_count, "supervisor active");
        Ok(())
    }

    /// Graceful shutdown: downstream-first stop, then release the lease.
    pub async fn shutdown(&self) {
        if self
            .state_machine
            .transition(ConnectionState::Stopping)
            .await
            .is_err()
        {
            // Not in a stoppable state (boot failed mid-way); recover first.
            self.state_machine.reset_to_idle().await;
        }

        if let Some(control) = self.control.lock().take() {
            control.stop();
        }
        self.alerts.stop();
        self.stop_pump();
        self.adapter.disconnect().await;
        self.scheduler.stop();

        let _ = self
            .state_machine
            .transition(ConnectionState::Stopped)
            .await;
        self.activity
            .record(ActivityEvent::StateTransition, "engine stopped", None)
            .await;

        if let Err(e) = self.settings.read().save(&self.settings_path) {
            warn!(error = %e, "settings save on shutdown failed");
        }
        self.registry.deregister().await;
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn warm_up(&self) {
        let settings = self.settings.read().clone();
        for symbol in &settings.symbols {
            self.warm_up_symbol(symbol, &settings).await;
        }
    }

    async fn warm_up_symbol(&self, symbol: &str, settings: &UserSettings) {
        if let Err(e) = backfill::backfill(
            &self.adapter,
            &self.candle_store,
            symbol,
            settings.base_timeframe,
            WARMUP_BARS,
        )
        .await
        {
            warn!(symbol, error = %e, "base warm-up backfill failed");
        }

        // The cache-read derivation path expects every higher timeframe to
        // be populated independently.
        if settings.derivation == Derivation::CacheRead {
            for &tf in settings.base_timeframe.derived() {
                if !settings.timeframes.contains(&tf) {
                    continue;
                }
                if let Err(e) =
                    backfill::backfill(&self.adapter, &self.candle_store, symbol, tf, WARMUP_BARS)
                        .await
                {
                    warn!(symbol, tf = %tf, error = %e, "derived warm-up backfill failed");
                }
            }
        }
    }

    /// Push the current settings grid into the scheduler and evaluator.
    fn reconfigure_readers(&self) {
        let configs = self.settings.read().indicator_configs();
        self.scheduler
            .configure(&configs, Utc::now().timestamp_millis());
        self.alerts.configure(&configs);
    }

    /// Open the exchange stream and spawn the event pump.
    async fn start_stream(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.adapter.connect(tx).await?;

        let (symbols, base) = {
            let settings = self.settings.read();
            (settings.symbols.clone(), settings.base_timeframe)
        };
        self.adapter.subscribe(&symbols, base).await?;

        let pump = EventPump {
            settings: self.settings.clone(),
            candle_store: self.candle_store.clone(),
            ticker_store: self.ticker_store.clone(),
            aggregator: self.aggregator.clone(),
        };
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pump.handle(event).await;
            }
        });

        let mut slot = self.pump.lock();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    // ── Command handlers ────────────────────────────────────────────────

    /// Stop downstream-to-upstream without releasing the lease.
    async fn pause(&self) -> anyhow::Result<serde_json::Value> {
        if self.is_paused() {
            return Ok(serde_json::json!({"paused": true, "changed": false}));
        }
        self.alerts.stop();
        self.adapter.disconnect().await;
        self.stop_pump();
        self.scheduler.stop();
        self.is_paused.store(true, Ordering::SeqCst);
        self.activity
            .record(ActivityEvent::AdminAction, "paused", None)
            .await;
        Ok(serde_json::json!({"paused": true, "changed": true}))
    }

    /// Start upstream-to-downstream again.
    async fn resume(&self) -> anyhow::Result<serde_json::Value> {
        if !self.is_paused() {
            return Ok(serde_json::json!({"paused": false, "changed": false}));
        }
        self.reconfigure_readers();
        self.scheduler.clone().start().await;
        self.start_stream().await?;
        self.alerts.clone().start().await;
        self.is_paused.store(false, Ordering::SeqCst);
        self.activity
            .record(ActivityEvent::AdminAction, "resumed", None)
            .await;
        Ok(serde_json::json!({"paused": false, "changed": true}))
    }

    async fn reload_settings(&self) -> anyhow::Result<serde_json::Value> {
        let Some(loaded) = self.store.load_settings(&self.identity_sub).await? else {
            return Ok(serde_json::json!({"reloaded": false, "reason": "no stored settings"}));
        };
        let symbol_count = loaded.symbols.len();
        *self.settings.write() = loaded;
        self.reconfigure_readers();
        self.registry
            .update_status(|s| s.symbol_count = symbol_count)
            .await;
        self.activity
            .record(ActivityEvent::AdminAction, "settings reloaded", None)
            .await;
        Ok(serde_json::json!({"reloaded": true, "symbols": symbol_count}))
    }

    async fn switch_mode(&self, mode: EngineMode) -> anyhow::Result<serde_json::Value> {
        self.settings.write().mode = mode;
        self.persist_settings().await?;
        self.activity
            .record(
                ActivityEvent::AdminAction,
                &format!("mode switched to {mode}"),
                None,
            )
            .await;
        Ok(serde_json::json!({"mode": mode.to_string()}))
    }

    async fn force_backfill(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
    ) -> anyhow::Result<serde_json::Value> {
        let mut written = 0usize;
        for &tf in timeframes {
            written +=
                backfill::backfill(&self.adapter, &self.candle_store, symbol, tf, WARMUP_BARS)
                    .await?;
            self.scheduler.force_recalculate(symbol, tf).await;
        }
        self.activity
            .record(
                ActivityEvent::AdminAction,
                &format!("force-backfill {symbol}"),
                None,
            )
            .await;
        Ok(serde_json::json!({"symbol": symbol, "candles": written}))
    }

    async fn clear_cache(&self, scope: &ClearScope) -> anyhow::Result<serde_json::Value> {
        let patterns = match scope {
            ClearScope::All => vec![
                self.scope.candles_pattern_all(),
                self.scope.indicator_pattern_all(),
            ],
            ClearScope::Symbol(symbol) => vec![
                self.scope.candles_pattern_symbol(symbol),
                self.scope.indicator_pattern_symbol(symbol),
            ],
            ClearScope::Timeframe { symbol, timeframe } => vec![
                self.scope
                    .candles_pattern_timeframe(symbol.as_deref(), *timeframe),
                self.scope
                    .indicator_pattern_timeframe(symbol.as_deref(), *timeframe),
            ],
        };

        let mut keys = Vec::new();
        for pattern in &patterns {
            keys.extend(
                self.cache
                    .scan_keys(pattern)
                    .await
                    .map_err(anyhow::Error::new)?,
            );
        }
        let deleted = delete_keys_batched(&self.cache, &keys)
            .await
            .map_err(anyhow::Error::new)?;
        self.activity
            .record(
                ActivityEvent::AdminAction,
                &format!("cache cleared ({deleted} keys)"),
                None,
            )
            .await;
        Ok(serde_json::json!({"deleted": deleted}))
    }

    async fn persist_settings(&self) -> anyhow::Result<()> {
        let snapshot = self.settings.read().clone();
        self.store.save_settings(&self.identity_sub, &snapshot).await
    }

    /// Push the current symbol set to the adapter and restart the alert
    /// evaluator's subscriptions. No-op while paused.
    async fn refresh_subscriptions(&self) -> anyhow::Result<()> {
        if self.is_paused() {
            return Ok(());
        }
        let (symbols, base) = {
            let settings = self.settings.read();
            (settings.symbols.clone(), settings.base_timeframe)
        };
        self.adapter.subscribe(&symbols, base).await?;

        self.alerts.stop();
        self.alerts
            .configure(&self.settings.read().indicator_configs());
        self.alerts.clone().start().await;
        Ok(())
    }

    async fn add_symbols(&self, raw_symbols: &[String]) -> anyhow::Result<serde_json::Value> {
        let mut added: Vec<String> = Vec::new();
        {
            let mut settings = self.settings.write();
            for raw in raw_symbols {
                if settings.add_symbol(raw) {
                    added.push(normalize_symbol(raw));
                }
            }
        }
        if added.is_empty() {
            return Ok(serde_json::json!({"added": 0}));
        }

        self.persist_settings().await?;
        self.reconfigure_readers();

        let settings = self.settings.read().clone();
        for symbol in &added {
            self.warm_up_symbol(symbol, &settings).await;
            for &tf in &settings.timeframes {
                self.scheduler.force_recalculate(symbol, tf).await;
            }
        }

        self.refresh_subscriptions().await?;
        let symbol_count = settings.symbols.len();
        self.registry
            .update_status(|s| s.symbol_count = symbol_count)
            .await;
        self.activity
            .record(
                ActivityEvent::AdminAction,
                &format!("symbols added: {}", added.join(", ")),
                None,
            )
            .await;
        Ok(serde_json::json!({"added": added.len(), "symbols": added}))
    }

    async fn remove_symbol(&self, raw: &str) -> anyhow::Result<serde_json::Value> {
        let removed = self.settings.write().remove_symbol(raw);
        if !removed {
            return Ok(serde_json::json!({"removed": false}));
        }
        let symbol = normalize_symbol(raw);

        self.persist_settings().await?;
        self.reconfigure_readers();
        self.aggregator.reset();

        // Sweep the symbol's cached series.
        let patterns = [
            self.scope.candles_pattern_symbol(&symbol),
            self.scope.indicator_pattern_symbol(&symbol),
        ];
        let mut keys = Vec::new();
        for pattern in &patterns {
            keys.extend(
                self.cache
                    .scan_keys(pattern)
                    .await
                    .map_err(anyhow::Error::new)?,
            );
        }
        delete_keys_batched(&self.cache, &keys)
            .await
            .map_err(anyhow::Error::new)?;

        self.refresh_subscriptions().await?;
        let symbol_count = self.settings.read().symbols.len();
        self.registry
            .update_status(|s| s.symbol_count = symbol_count)
            .await;
        self.activity
            .record(
                ActivityEvent::AdminAction,
                &format!("symbol removed: {symbol}"),
                None,
            )
            .await;
        Ok(serde_json::json!({"removed": true, "symbol": symbol}))
    }
}

#[async_trait]
impl CommandExecutor for Supervisor {
    async fn execute(&self, command: Command) -> anyhow::Result<serde_json::Value> {
        match command {
            Command::Pause => self.pause().await,
            Command::Resume => self.resume().await,
            Command::ReloadSettings => self.reload_settings().await,
            Command::SwitchMode { mode } => self.switch_mode(mode).await,
            Command::ForceBackfill { symbol, timeframes } => {
                self.force_backfill(&symbol, &timeframes).await
            }
            Command::ClearCache { scope } => self.clear_cache(&scope).await,
            Command::AddSymbol { symbol } => {
                self.add_symbols(std::slice::from_ref(&symbol)).await
            }
            Command::RemoveSymbol { symbol } => self.remove_symbol(&symbol).await,
            Command::BulkAddSymbols { symbols } => self.add_symbols(&symbols).await,
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
    use crate::cache::SetMode;
    use crate::notifier::AlertEmbed;
    use crate::renderer::NullRenderer;
    use crate::types::{AlertRecord, Candle, INDICATOR_MACD_V};
    use std::collections::HashMap;

    // ── Doubles ─────────────────────────────────────────────────────────

    struct FakeAdapter {
        connected: AtomicBool,
        subscriptions: Mutex<Vec<Vec<String>>>,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn connect(
            &self,
            _events: mpsc::UnboundedSender<MarketEvent>,
        ) -> anyhow::Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        async fn subscribe(&self, symbols: &[String], _tf: Timeframe) -> anyhow::Result<()> {
            self.subscriptions.lock().push(symbols.to_vec());
            Ok(())
        }
        async fn get_candles(
            &self,
            symbol: &str,
            tf: Timeframe,
            start_ms: i64,
            end_ms: i64,
        ) -> anyhow::Result<Vec<Candle>> {
            let mut out = Vec::new();
            let mut ts = tf.bucket(start_ms);
            let mut i = 0;
            while ts < end_ms {
                let base = 100.0 + i as f64 * 0.2;
                out.push(Candle {
                    timestamp: ts,
                    open: base - 0.5,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base,
                    volume: 2.0,
                    symbol: symbol.to_string(),
                    timeframe: tf,
                    is_synthetic: false,
                });
                ts += tf.ms();
                i += 1;
            }
            Ok(out)
        }
        async fn get_accounts(&self) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn get_spot_prices(
            &self,
            _symbols: &[String],
        ) -> anyhow::Result<HashMap<String, f64>> {
            Ok(HashMap::new())
        }
    }

    struct MemStore {
        settings: Mutex<Option<UserSettings>>,
    }

    #[async_trait]
    impl PersistentStore for MemStore {
        async fn insert_alert(&self, record: &AlertRecord) -> anyhow::Result<String> {
            Ok(record.id.clone())
        }
        async fn load_settings(&self, _sub: &str) -> anyhow::Result<Option<UserSettings>> {
            Ok(self.settings.lock().clone())
        }
        async fn save_settings(
            &self,
            _sub: &str,
            settings: &UserSettings,
        ) -> anyhow::Result<()> {
            *self.settings.lock() = Some(settings.clone());
            Ok(())
        }
    }

    struct QuietNotifier;

    #[async_trait]
    impl Notifier for QuietNotifier {
        async fn send_alert(
            &self,
            _embed: &AlertEmbed,
            _image: Option<&[u8]>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        cache: Arc<dyn CacheService>,
        adapter: Arc<FakeAdapter>,
        store: Arc<MemStore>,
    }

    fn fixture() -> Fixture {
        let config = EnvConfig {
            identity_sub: "sub-1".into(),
            exchange_id: "coinbase".into(),
            exchange_name: "Coinbase".into(),
            cache_url: None,
            store_path: "unused".into(),
            settings_path: std::env::temp_dir().join(format!(
                "livermore-settings-{}.json",
                uuid::Uuid::new_v4()
            )),
            webhook_url: None,
            geolocation_url: None,
            api_key: String::new(),
            api_secret: String::new(),
        };
        let settings = UserSettings {
            symbols: vec!["BTC-USD".into()],
            timeframes: vec![Timeframe::M1, Timeframe::M5],
            ..UserSettings::default()
        };

        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let adapter = Arc::new(FakeAdapter::new());
        let store = Arc::new(MemStore {
            settings: Mutex::new(None),
        });

        let supervisor = Supervisor::build(
            &config,
            settings,
            cache.clone(),
            adapter.clone(),
            store.clone(),
            Arc::new(QuietNotifier),
            Arc::new(NullRenderer),
            "host-a".into(),
        );
        Fixture {
            supervisor,
            cache,
            adapter,
            store,
        }
    }

    #[tokio::test]
    async fn boot_reaches_active_and_holds_lease() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        assert_eq!(f.supervisor.connection_state(), ConnectionState::Active);
        assert!(f
            .cache
            .kv_get("exchange:coinbase:status")
            .await
            .unwrap()
            .is_some());
        assert!(f.adapter.connected.load(Ordering::SeqCst));
        // Warm-up populated the base candle series.
        let store = CandleStore::new(f.cache.clone(), Scope::new("sub-1", "coinbase"));
        assert!(store.count("BTC-USD", Timeframe::M1).await.unwrap() >= 60);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_lease_and_stops_stream() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();
        f.supervisor.shutdown().await;

        assert_eq!(f.supervisor.connection_state(), ConnectionState::Stopped);
        assert!(!f.adapter.connected.load(Ordering::SeqCst));
        assert!(f
            .cache
            .kv_get("exchange:coinbase:status")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lease_conflict_aborts_boot() {
        let f = fixture();
        // Another host already owns the exchange.
        let foreign = InstanceRegistry::new(f.cache.clone(), "coinbase", "Coinbase", "host-z");
        foreign.register().await.unwrap();

        let err = f.supervisor.clone().start().await.unwrap_err();
        assert!(matches!(err, EngineError::LeaseConflict(_)));
        assert_eq!(f.supervisor.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_the_stack() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let out = f.supervisor.execute(Command::Pause).await.unwrap();
        assert_eq!(out["paused"], true);
        assert!(f.supervisor.is_paused());
        assert!(!f.adapter.connected.load(Ordering::SeqCst));

        // Pausing twice is a no-op.
        let out = f.supervisor.execute(Command::Pause).await.unwrap();
        assert_eq!(out["changed"], false);

        let out = f.supervisor.execute(Command::Resume).await.unwrap();
        assert_eq!(out["paused"], false);
        assert!(!f.supervisor.is_paused());
        assert!(f.adapter.connected.load(Ordering::SeqCst));

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn add_symbol_persists_reconfigures_and_resubscribes() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let out = f
            .supervisor
            .execute(Command::AddSymbol {
                symbol: "eth-usd".into(),
            })
            .await
            .unwrap();
        assert_eq!(out["added"], 1);

        let settings = f.supervisor.settings_snapshot();
        assert!(settings.symbols.contains(&"ETH-USD".to_string()));
        // Persisted to the store...
        let stored = f.store.settings.lock().clone().expect("saved settings");
        assert!(stored.symbols.contains(&"ETH-USD".to_string()));
        // ...and the adapter saw a refreshed subscription with both symbols.
        let subs = f.adapter.subscriptions.lock();
        let last = subs.last().expect("subscription");
        assert!(last.contains(&"ETH-USD".to_string()));
        drop(subs);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn remove_symbol_sweeps_cache_keys() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        // Seed an indicator key that the sweep must remove.
        f.cache
            .kv_set(
                &format!("indicator:sub-1:coinbase:BTC-USD:1m:{INDICATOR_MACD_V}"),
                "{}",
                SetMode::WithTtl(None),
            )
            .await
            .unwrap();

        let out = f
            .supervisor
            .execute(Command::RemoveSymbol {
                symbol: "BTC-USD".into(),
            })
            .await
            .unwrap();
        assert_eq!(out["removed"], true);

        assert!(f.supervisor.settings_snapshot().symbols.is_empty());
        let leftovers = f.cache.scan_keys("candles:sub-1:coinbase:*").await.unwrap();
        assert!(leftovers.is_empty(), "candle keys swept: {leftovers:?}");
        let leftovers = f
            .cache
            .scan_keys("indicator:sub-1:coinbase:*")
            .await
            .unwrap();
        assert!(leftovers.is_empty(), "indicator keys swept: {leftovers:?}");

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn switch_mode_validates_and_persists() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let out = f
            .supervisor
            .execute(Command::SwitchMode {
                mode: EngineMode::Aggressive,
            })
            .await
            .unwrap();
        assert_eq!(out["mode"], "aggressive");
        assert_eq!(f.supervisor.settings_snapshot().mode, EngineMode::Aggressive);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_settings_pulls_from_store() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let mut stored = UserSettings::default();
        stored.symbols = vec!["SOL-USD".into()];
        *f.store.settings.lock() = Some(stored);

        let out = f.supervisor.execute(Command::ReloadSettings).await.unwrap();
        assert_eq!(out["reloaded"], true);
        assert_eq!(
            f.supervisor.settings_snapshot().symbols,
            vec!["SOL-USD".to_string()]
        );

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn force_backfill_writes_and_recalculates() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let out = f
            .supervisor
            .execute(Command::ForceBackfill {
                symbol: "BTC-USD".into(),
                timeframes: vec![Timeframe::M5],
            })
            .await
            .unwrap();
        assert!(out["candles"].as_u64().unwrap_or(0) > 0);

        let store = CandleStore::new(f.cache.clone(), Scope::new("sub-1", "coinbase"));
        assert!(store.count("BTC-USD", Timeframe::M5).await.unwrap() > 0);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn clear_cache_all_sweeps_scope() {
        let f = fixture();
        f.supervisor.clone().start().await.unwrap();

        let out = f
            .supervisor
            .execute(Command::ClearCache {
                scope: ClearScope::All,
            })
            .await
            .unwrap();
        // Warm-up seeded candles, so something must have been deleted.
        assert!(out["deleted"].as_u64().unwrap_or(0) > 0);
        let leftovers = f.cache.scan_keys("candles:sub-1:coinbase:*").await.unwrap();
        assert!(leftovers.is_empty());

        f.supervisor.shutdown().await;
    }
}
