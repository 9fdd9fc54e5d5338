// =============================================================================
// Livermore — Main Entry Point
// =============================================================================
//
// One process per (user, exchange) pair. Boot claims the exclusive exchange
// lease before anything else starts; a conflict exits non-zero with the
// holder's diagnostics. Ctrl+C runs the ordered shutdown and releases the
// lease.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod activity;
mod alerts;
mod cache;
mod cache_keys;
mod config;
mod control;
mod errors;
mod exchange;
mod indicators;
mod market_data;
mod notifier;
mod registry;
mod renderer;
mod scheduler;
mod settings;
mod state_machine;
mod store;
mod supervisor;
mod timeframe;
mod types;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::memory::MemoryCache;
use crate::cache::CacheService;
use crate::config::EnvConfig;
use crate::errors::EngineError;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::ExchangeAdapter;
use crate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::renderer::NullRenderer;
use crate::settings::UserSettings;
use crate::store::sqlite::SqliteStore;
use crate::store::PersistentStore;
use crate::supervisor::Supervisor;

/// Exit codes: 1 = fatal boot error, 2 = lease conflict.
const EXIT_FATAL: u8 = 1;
const EXIT_LEASE_CONFLICT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Livermore Market Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match EnvConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid environment configuration");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    info!(
        exchange = %config.exchange_id,
        identity = %config.identity_sub,
        "instance configured"
    );

    // ── 2. User settings ─────────────────────────────────────────────────
    let settings = UserSettings::load(&config.settings_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        UserSettings::default()
    });
    info!(symbols = ?settings.symbols, base = %settings.base_timeframe, "monitoring");

    // ── 3. Collaborators ─────────────────────────────────────────────────
    if config.cache_url.is_some() {
        warn!("LIVERMORE_CACHE_URL set, but this build ships the in-process cache backend");
    }
    let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());

    let store: Arc<dyn PersistentStore> = match SqliteStore::open(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "persistent store unavailable");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    // Seed the stored settings blob so reload-settings has something to read.
    if let Ok(None) = store.load_settings(&config.identity_sub).await {
        if let Err(e) = store.save_settings(&config.identity_sub, &settings).await {
            warn!(error = %e, "initial settings mirror failed");
        }
    }

    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(BinanceAdapter::new(
        config.api_key.clone(),
        config.api_secret.clone(),
    ));

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => {
            warn!("no webhook configured — alerts will be log-only");
            Arc::new(LogNotifier)
        }
    };

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    // ── 4. Build & start ─────────────────────────────────────────────────
    let supervisor = Supervisor::build(
        &config,
        settings,
        cache,
        adapter,
        store,
        notifier,
        Arc::new(NullRenderer),
        hostname,
    );

    if let Some(url) = &config.geolocation_url {
        if let Some((ip, country)) = lookup_geolocation(url).await {
            supervisor.set_network_identity(ip, country).await;
        }
    }

    match supervisor.clone().start().await {
        Ok(()) => {}
        Err(EngineError::LeaseConflict(msg)) => {
            error!(reason = %msg, "another instance owns this exchange");
            return ExitCode::from(EXIT_LEASE_CONFLICT);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            supervisor.shutdown().await;
            return ExitCode::from(EXIT_FATAL);
        }
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    warn!("Shutdown signal received — stopping gracefully");
    supervisor.shutdown().await;

    info!("Livermore shut down complete.");
    ExitCode::SUCCESS
}

/// Best-effort IP/geolocation lookup for the instance status payload.
/// Expects a JSON body with `ip` and `country_code` (or `country`) fields.
async fn lookup_geolocation(url: &str) -> Option<(Option<String>, Option<String>)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .ok()?;
    let body: serde_json::Value = client.get(url).send().await.ok()?.json().await.ok()?;

    let ip = body["ip"].as_str().map(str::to_string);
    let country = body["country_code"]
        .as_str()
        .or_else(|| body["country"].as_str())
        .map(str::to_string);
    if ip.is_none() && country.is_none() {
        return None;
    }
    Some((ip, country))
}
