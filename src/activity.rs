// =============================================================================
// Activity log — append-only, time-trimmed event stream per exchange
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::CacheService;
use crate::cache_keys::activity_stream_key;

/// Entries older than this are trimmed on every append.
pub const RETENTION_MS: i64 = 90 * 24 * 60 * 60 * 1_000;

/// The closed set of activity event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    StateTransition,
    Error,
    AdminAction,
}

impl ActivityEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateTransition => "state_transition",
            Self::Error => "error",
            Self::AdminAction => "admin_action",
        }
    }
}

pub struct ActivityLog {
    cache: Arc<dyn CacheService>,
    key: String,
}

impl ActivityLog {
    pub fn new(cache: Arc<dyn CacheService>, exchange: &str) -> Self {
        Self {
            cache,
            key: activity_stream_key(exchange),
        }
    }

    /// Append one event and trim everything older than the retention window.
    /// Fire-and-forget: failures are logged, never raised.
    pub async fn record(&self, event: ActivityEvent, summary: &str, detail: Option<&str>) {
        let now = Utc::now();
        let mut fields = vec![
            ("event".to_string(), event.as_str().to_string()),
            ("summary".to_string(), summary.to_string()),
            ("at".to_string(), now.to_rfc3339()),
        ];
        if let Some(detail) = detail {
            fields.push(("detail".to_string(), detail.to_string()));
        }

        if let Err(e) = self.cache.stream_append(&self.key, &fields).await {
            debug!(key = %self.key, error = %e, "activity append failed");
        }

        let min_id = format!("{}-0", now.timestamp_millis() - RETENTION_MS);
        if let Err(e) = self.cache.stream_trim_min_id(&self.key, &min_id).await {
            debug!(key = %self.key, error = %e, "activity trim failed");
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

    #[tokio::test]
    async fn record_appends_entries() {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let log = ActivityLog::new(cache.clone(), "coinbase");

        log.record(ActivityEvent::StateTransition, "idle -> starting", None)
            .await;
        log.record(
            ActivityEvent::Error,
            "stream dropped",
            Some("ws read error"),
        )
        .await;

        assert_eq!(
            cache.stream_len("livermore:activity:coinbase").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn fresh_entries_survive_trim() {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let log = ActivityLog::new(cache.clone(), "coinbase");

        for i in 0..5 {
            log.record(ActivityEvent::AdminAction, &format!("action {i}"), None)
                .await;
        }
        // All five were appended inside the retention window.
        assert_eq!(
            cache.stream_len("livermore:activity:coinbase").await.unwrap(),
            5
        );
    }
}
