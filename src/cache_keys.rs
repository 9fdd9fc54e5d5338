// =============================================================================
// Cache keys & pub/sub channel naming
// =============================================================================
//
// Every stream, key, and topic the engine touches is produced here so that
// two processes scoped to the same (user, exchange) always agree on names.
// Nothing in this module performs I/O.
// =============================================================================

use crate::timeframe::Timeframe;

/// The (user, exchange) pair a running instance is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub user: String,
    pub exchange: String,
}

impl Scope {
    pub fn new(user: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            exchange: exchange.into(),
        }
    }

    // ── Keyed data ──────────────────────────────────────────────────────

    /// Ordered candle set: `candles:{user}:{exchange}:{symbol}:{tf}`.
    pub fn candles_key(&self, symbol: &str, tf: Timeframe) -> String {
        format!("candles:{}:{}:{}:{}", self.user, self.exchange, symbol, tf)
    }

    /// Latest indicator value:
    /// `indicator:{user}:{exchange}:{symbol}:{tf}:{type}`.
    pub fn indicator_key(&self, symbol: &str, tf: Timeframe, kind: &str) -> String {
        format!(
            "indicator:{}:{}:{}:{}:{}",
            self.user, self.exchange, symbol, tf, kind
        )
    }

    /// Latest ticker: `ticker:{user}:{exchange}:{symbol}`.
    pub fn ticker_key(&self, symbol: &str) -> String {
        format!("ticker:{}:{}:{}", self.user, self.exchange, symbol)
    }

    // ── Pub/sub topics ──────────────────────────────────────────────────

    pub fn candle_close_channel(&self, symbol: &str, tf: Timeframe) -> String {
        format!(
            "channel:candle:close:{}:{}:{}:{}",
            self.user, self.exchange, symbol, tf
        )
    }

    /// Wildcard pattern matching every symbol's candle-close topic at `tf`.
    pub fn candle_close_pattern(&self, tf: Timeframe) -> String {
        format!(
            "channel:candle:close:{}:{}:*:{}",
            self.user, self.exchange, tf
        )
    }

    pub fn indicator_channel(&self, symbol: &str, tf: Timeframe, kind: &str) -> String {
        format!(
            "channel:indicator:{}:{}:{}:{}:{}",
            self.user, self.exchange, symbol, tf, kind
        )
    }

    pub fn ticker_channel(&self, symbol: &str) -> String {
        format!("channel:ticker:{}:{}:{}", self.user, self.exchange, symbol)
    }

    // ── Scan prefixes (clear-cache) ─────────────────────────────────────

    /// Glob matching every candle key in this scope.
    pub fn candles_pattern_all(&self) -> String {
        format!("candles:{}:{}:*", self.user, self.exchange)
    }

    /// Glob matching every candle key for one symbol.
    pub fn candles_pattern_symbol(&self, symbol: &str) -> String {
        format!("candles:{}:{}:{}:*", self.user, self.exchange, symbol)
    }

    /// Glob matching every indicator key in this scope.
    pub fn indicator_pattern_all(&self) -> String {
        format!("indicator:{}:{}:*", self.user, self.exchange)
    }

    /// Glob matching every indicator key for one symbol.
    pub fn indicator_pattern_symbol(&self, symbol: &str) -> String {
        format!("indicator:{}:{}:{}:*", self.user, self.exchange, symbol)
    }

    /// Glob matching candle keys at one timeframe, optionally per symbol.
    pub fn candles_pattern_timeframe(&self, symbol: Option<&str>, tf: Timeframe) -> String {
        format!(
            "candles:{}:{}:{}:{}",
            self.user,
            self.exchange,
            symbol.unwrap_or("*"),
            tf
        )
    }

    /// Glob matching indicator keys at one timeframe, optionally per symbol.
    pub fn indicator_pattern_timeframe(&self, symbol: Option<&str>, tf: Timeframe) -> String {
        format!(
            "indicator:{}:{}:{}:{}:*",
            self.user,
            self.exchange,
            symbol.unwrap_or("*"),
            tf
        )
    }
}

// ── Unscoped names ──────────────────────────────────────────────────────

/// Per-exchange alert fan-out topic: `channel:alert:{exchange}`.
pub fn alert_channel(exchange: &str) -> String {
    format!("channel:alert:{exchange}")
}

/// Inbound command topic for one identity.
pub fn commands_channel(identity_sub: &str) -> String {
    format!("livermore:commands:{identity_sub}")
}

/// Outbound command-response topic for one identity.
pub fn responses_channel(identity_sub: &str) -> String {
    format!("livermore:responses:{identity_sub}")
}

/// Priority-ordered command queue for one identity.
pub fn command_queue_key(identity_sub: &str) -> String {
    format!("livermore:command-queue:{identity_sub}")
}

/// Exclusive-lease key for one exchange: `exchange:{id}:status`.
pub fn instance_status_key(exchange_id: &str) -> String {
    format!("exchange:{exchange_id}:status")
}

/// Append-only activity stream for one exchange.
pub fn activity_stream_key(exchange: &str) -> String {
    format!("livermore:activity:{exchange}")
}
