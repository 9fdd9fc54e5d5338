// =============================================================================
// User settings — hot-reloadable monitoring configuration with atomic save
// =============================================================================
//
// The settings blob describes WHAT the instance watches: monitored symbols,
// the base timeframe the aggregator produces, the derived timeframes the
// scheduler maintains, and how derived bars are obtained. Every field carries
// a serde default so older blobs keep loading after new fields appear.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. The same blob is mirrored into the persistent store so that
// `reload-settings` can pull it back by identity.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::timeframe::Timeframe;
use crate::types::EngineMode;

fn default_symbols() -> Vec<String> {
    vec!["BTC-USD".to_string(), "ETH-USD".to_string(), "SOL-USD".to_string()]
}

fn default_base_timeframe() -> Timeframe {
    Timeframe::M1
}

fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}

/// How the scheduler obtains bars for a derived timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Derivation {
    /// Read that timeframe's bars straight from the cache; a backfill
    /// collaborator keeps them populated.
    CacheRead,
    /// Aggregate base-timeframe bars in memory on each boundary.
    Aggregate,
}

impl Default for Derivation {
    fn default() -> Self {
        Self::Aggregate
    }
}

/// One (symbol, timeframe) pair the indicator scheduler maintains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
}

/// Top-level user settings for one (user, exchange) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    /// Symbols the instance is monitoring.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframe the aggregator produces and the scheduler derives from.
    #[serde(default = "default_base_timeframe")]
    pub base_timeframe: Timeframe,

    /// Timeframes indicator values are maintained at.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// How derived-timeframe bars are obtained.
    #[serde(default)]
    pub derivation: Derivation,

    /// Current engine mode (switchable via the control channel).
    #[serde(default)]
    pub mode: EngineMode,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            base_timeframe: default_base_timeframe(),
            timeframes: default_timeframes(),
            derivation: Derivation::default(),
            mode: EngineMode::default(),
        }
    }
}

/// Canonical symbol form: trimmed, uppercase.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

impl UserSettings {
    /// The (symbol, timeframe) grid the indicator scheduler maintains.
    pub fn indicator_configs(&self) -> Vec<IndicatorConfig> {
        let mut configs = Vec::with_capacity(self.symbols.len() * self.timeframes.len());
        for symbol in &self.symbols {
            for &timeframe in &self.timeframes {
                configs.push(IndicatorConfig {
                    symbol: symbol.clone(),
                    timeframe,
                });
            }
        }
        configs
    }

    /// Add a symbol (normalised). Returns false when it was already present.
    pub fn add_symbol(&mut self, raw: &str) -> bool {
        let symbol = normalize_symbol(raw);
        if symbol.is_empty() || self.symbols.contains(&symbol) {
            return false;
        }
        self.symbols.push(symbol);
        true
    }

    /// Remove a symbol (normalised). Returns false when it was not present.
    pub fn remove_symbol(&mut self, raw: &str) -> bool {
        let symbol = normalize_symbol(raw);
        let before = self.symbols.len();
        self.symbols.retain(|s| s != &symbol);
        self.symbols.len() != before
    }

    /// Load settings from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?settings.symbols,
            base = %settings.base_timeframe,
            "user settings loaded"
        );

        Ok(settings)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "user settings saved (atomic)");
        Ok(())
    }
}
