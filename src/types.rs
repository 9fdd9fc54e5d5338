// =============================================================================
// Shared types used across the Livermore engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

// =============================================================================
// Market data
// =============================================================================

/// A closed OHLCV bar, aligned to the start of its timeframe bucket.
///
/// Invariants (enforced by the aggregator and relied on everywhere):
///   - `timestamp % timeframe.ms() == 0`
///   - `low <= min(open, close)` and `max(open, close) <= high`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, epoch milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// True for placeholder bars inserted by gap-fill. Synthetic bars feed
    /// the price EMAs but are skipped by the informative ATR.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_synthetic: bool,
}

/// Latest-only ticker snapshot, overwritten on each trade event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub change_24h: f64,
    #[serde(default)]
    pub change_pct_24h: f64,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub high_24h: f64,
    #[serde(default)]
    pub low_24h: f64,
    /// Event time, epoch milliseconds.
    pub timestamp: i64,
}

// =============================================================================
// Indicator output
// =============================================================================

/// Discrete market stage derived from MACD-V level + histogram direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Oversold,
    Rebounding,
    Rallying,
    Ranging,
    Retracing,
    Reversing,
    Overbought,
    Unknown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Oversold => "oversold",
            Self::Rebounding => "rebounding",
            Self::Rallying => "rallying",
            Self::Ranging => "ranging",
            Self::Retracing => "retracing",
            Self::Reversing => "reversing",
            Self::Overbought => "overbought",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Data-quality grade derived from the gap ratio of the input series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    A,
    B,
    C,
    D,
    F,
}

impl std::fmt::Display for Liquidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        };
        f.write_str(s)
    }
}

/// The numeric core of a MACD-V computation at one bar close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MacdVValue {
    #[serde(rename = "macdV")]
    pub macd_v: f64,
    pub signal: f64,
    pub histogram: f64,
    #[serde(rename = "fastEMA")]
    pub fast_ema: f64,
    #[serde(rename = "slowEMA")]
    pub slow_ema: f64,
    pub atr: f64,
}

/// Parameters + diagnostics accompanying every indicator value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub atr_period: usize,
    pub signal_period: usize,
    pub stage: Stage,
    pub liquidity: Liquidity,
    pub gap_ratio: f64,
    pub zero_range_ratio: f64,
    /// True once the informative ATR has seen `atr_period` real bars.
    pub seeded: bool,
    /// Real (non-synthetic) bars that contributed to the ATR.
    pub n_eff: usize,
    /// Total bars seen since ATR seeding began.
    pub span_bars: usize,
    /// Set when the value could not be fully computed:
    /// "warmup" | "insufficient_real_bars" | "all_zero_range".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Latest-only indicator value per (symbol, timeframe, type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorValue {
    /// Bar close timestamp, epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub indicator_type: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub value: MacdVValue,
    pub params: IndicatorParams,
}

/// The only indicator type this engine computes.
pub const INDICATOR_MACD_V: &str = "macd-v";

// =============================================================================
// Alerts
// =============================================================================

/// Immutable record of a triggered alert, persisted to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub alert_type: String,
    pub triggered_at: DateTime<Utc>,
    pub price: f64,
    pub trigger_value: f64,
    /// "level_-250", "reversal_oversold", "reversal_overbought", ...
    pub trigger_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_label: Option<String>,
    pub details: serde_json::Value,
    pub chart_generated: bool,
    pub notification_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_error: Option<String>,
}

// =============================================================================
// Instance lifecycle
// =============================================================================

/// Connection lifecycle state. Transitions are guarded by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Starting,
    Warming,
    Active,
    Stopping,
    Stopped,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Warming => "warming",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The lease payload written under `exchange:{id}:status`.
///
/// One per exchange; lives only while the lease is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub exchange_id: String,
    pub exchange_name: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_display_name: Option<String>,
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub symbol_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    pub last_heartbeat: i64,
    pub last_state_change: i64,
    pub registered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<i64>,
}

/// Engine operating mode, switchable via the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineMode {
    Standard,
    Conservative,
    Aggressive,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
        };
        f.write_str(s)
    }
}

impl EngineMode {
    /// Parse a wire token, rejecting anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "conservative" => Some(Self::Conservative),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }
}
