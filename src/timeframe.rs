// =============================================================================
// Timeframe — the closed set of bar durations the engine understands
// =============================================================================

use serde::{Deserialize, Serialize};

/// Bar duration. Ordering follows duration, so `M1 < D1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// All timeframes, shortest first.
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Duration of one bar in milliseconds.
    pub fn ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    /// The wire / cache-key token for this timeframe ("1m", "4h", ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Parse a wire token. Returns `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Align a millisecond timestamp down to the start of its bucket.
    pub fn bucket(self, ts_ms: i64) -> i64 {
        (ts_ms / self.ms()) * self.ms()
    }

    /// The higher timeframes derived from this base.
    ///
    /// A 1m base derives {5m, 15m, 1h, 4h, 1d}; a 5m base derives
    /// {15m, 1h, 4h, 1d}. Other bases derive nothing.
    pub fn derived(self) -> &'static [Timeframe] {
        match self {
            Self::M1 => &[Self::M5, Self::M15, Self::H1, Self::H4, Self::D1],
            Self::M5 => &[Self::M15, Self::H1, Self::H4, Self::D1],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
