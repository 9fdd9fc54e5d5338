// =============================================================================
// Alerts
// =============================================================================

pub mod bias;
pub mod evaluator;

pub use evaluator::AlertEvaluator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

pub const ALERT_TYPE_MACDV: &str = "macdv";

/// Which way a level was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Which extreme zone a reversal fired from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Oversold,
    Overbought,
}

/// What tripped an alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertTrigger {
    LevelCross { level: i32, direction: Direction },
    Reversal { zone: Zone },
}

impl AlertTrigger {
    /// Canonical label: `level_-250`, `reversal_oversold`, ...
    pub fn label(&self) -> String {
        match self {
            Self::LevelCross { level, .. } => format!("level_{level}"),
            Self::Reversal { zone: Zone::Oversold } => "reversal_oversold".to_string(),
            Self::Reversal { zone: Zone::Overbought } => "reversal_overbought".to_string(),
        }
    }
}

/// The payload published on `channel:alert:{exchange}` for cross-exchange
/// observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertAnnouncement {
    pub id: String,
    pub symbol: String,
    pub alert_type: String,
    pub timeframe: Timeframe,
    pub price: f64,
    pub trigger_value: f64,
    pub signal_delta: f64,
    pub triggered_at: DateTime<Utc>,
    pub source_exchange_id: String,
    pub source_exchange_name: String,
    pub trigger_label: String,
}
