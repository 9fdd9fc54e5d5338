// =============================================================================
// Command & response wire types
// =============================================================================
//
// Commands arrive as JSON envelopes on `livermore:commands:{sub}` and are
// parsed into a closed tagged union. Responses mirror the envelope's
// correlation id back on `livermore:responses:{sub}`: exactly one `ack`
// followed by exactly one `success` or `error` per executed command.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::settings::normalize_symbol;
use crate::timeframe::Timeframe;
use crate::types::EngineMode;

/// Commands older than this are answered with an error and dropped.
pub const COMMAND_EXPIRY_MS: i64 = 30_000;

// =============================================================================
// Envelope
// =============================================================================

/// The raw command envelope as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Lower = more urgent. Falls back to the per-type default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Sender clock, epoch milliseconds.
    pub timestamp: i64,
}

impl CommandEnvelope {
    /// Whether the command aged out in transit.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp > COMMAND_EXPIRY_MS
    }

    /// Effective queue score: explicit priority, else the type default.
    pub fn effective_priority(&self, command: &Command) -> i64 {
        self.priority.unwrap_or_else(|| command.default_priority())
    }
}

// =============================================================================
// Parsed commands
// =============================================================================

/// What a clear-cache command sweeps.
#[derive(Debug, Clone, PartialEq)]
pub enum ClearScope {
    All,
    Symbol(String),
    Timeframe {
        symbol: Option<String>,
        timeframe: Timeframe,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    ReloadSettings,
    SwitchMode {
        mode: EngineMode,
    },
    ForceBackfill {
        symbol: String,
        timeframes: Vec<Timeframe>,
    },
    ClearCache {
        scope: ClearScope,
    },
    AddSymbol {
        symbol: String,
    },
    RemoveSymbol {
        symbol: String,
    },
    BulkAddSymbols {
        symbols: Vec<String>,
    },
}

fn payload_str<'a>(payload: Option<&'a serde_json::Value>, field: &str) -> Result<&'a str, String> {
    payload
        .and_then(|p| p.get(field))
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("payload field '{field}' is required"))
}

fn payload_timeframe(raw: &str) -> Result<Timeframe, String> {
    Timeframe::parse(raw).ok_or_else(|| format!("unknown timeframe '{raw}'"))
}

impl Command {
    /// Parse and validate a command from its envelope. Symbols are
    /// normalised (trimmed, uppercased) on the way in.
    pub fn parse(envelope: &CommandEnvelope) -> Result<Self, String> {
        let payload = envelope.payload.as_ref();
        match envelope.command_type.as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "reload-settings" => Ok(Self::ReloadSettings),
            "switch-mode" => {
                let raw = payload_str(payload, "mode")?;
                let mode =
                    EngineMode::parse(raw).ok_or_else(|| format!("unknown mode '{raw}'"))?;
                Ok(Self::SwitchMode { mode })
            }
            "force-backfill" => {
                let symbol = normalize_symbol(payload_str(payload, "symbol")?);
                let raw_tfs = payload
                    .and_then(|p| p.get("timeframes"))
                    .and_then(|v| v.as_array())
                    .ok_or("payload field 'timeframes' is required")?;
                let mut timeframes = Vec::with_capacity(raw_tfs.len());
                for raw in raw_tfs {
                    let s = raw.as_str().ok_or("timeframes must be strings")?;
                    timeframes.push(payload_timeframe(s)?);
                }
                if timeframes.is_empty() {
                    return Err("timeframes must not be empty".to_string());
                }
                Ok(Self::ForceBackfill { symbol, timeframes })
            }
            "clear-cache" => {
                let scope = match payload_str(payload, "scope")? {
                    "all" => ClearScope::All,
                    "symbol" => {
                        ClearScope::Symbol(normalize_symbol(payload_str(payload, "symbol")?))
                    }
                    "timeframe" => ClearScope::Timeframe {
                        symbol: payload
                            .and_then(|p| p.get("symbol"))
                            .and_then(|v| v.as_str())
                            .map(normalize_symbol),
                        timeframe: payload_timeframe(payload_str(payload, "timeframe")?)?,
                    },
                    other => return Err(format!("unknown clear-cache scope '{other}'")),
                };
                Ok(Self::ClearCache { scope })
            }
            "add-symbol" => Ok(Self::AddSymbol {
                symbol: normalize_symbol(payload_str(payload, "symbol")?),
            }),
            "remove-symbol" => Ok(Self::RemoveSymbol {
                symbol: normalize_symbol(payload_str(payload, "symbol")?),
            }),
            "bulk-add-symbols" => {
                let raw_symbols = payload
                    .and_then(|p| p.get("symbols"))
                    .and_then(|v| v.as_array())
                    .ok_or("payload field 'symbols' is required")?;
                let symbols: Vec<String> = raw_symbols
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(normalize_symbol)
                    .filter(|s| !s.is_empty())
                    .collect();
                if symbols.is_empty() {
                    return Err("symbols must not be empty".to_string());
                }
                Ok(Self::BulkAddSymbols { symbols })
            }
            other => Err(format!("unknown command type '{other}'")),
        }
    }

    /// Default queue priority per type; lower is more urgent.
    pub fn default_priority(&self) -> i64 {
        match self {
            Self::Pause | Self::Resume => 1,
            Self::ReloadSettings | Self::SwitchMode { .. } => 10,
            Self::AddSymbol { .. } | Self::RemoveSymbol { .. } | Self::BulkAddSymbols { .. } => 15,
            Self::ForceBackfill { .. } | Self::ClearCache { .. } => 20,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ack,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub correlation_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
}

impl CommandResponse {
    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn ack(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            status: ResponseStatus::Ack,
            data: None,
            message: None,
            timestamp: Self::now_ms(),
        }
    }

    pub fn success(correlation_id: &str, data: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            status: ResponseStatus::Success,
            data: Some(data),
            message: None,
            timestamp: Self::now_ms(),
        }
    }

    pub fn error(correlation_id: &str, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.into()),
            timestamp: Self::now_ms(),
        }
    }
}
