// =============================================================================
// Instance registry — exclusive per-exchange lease with heartbeat
// =============================================================================
//
// Exactly one instance may hold `exchange:{id}:status` at a time. The claim
// is a create-only write with a 45 s TTL; a 15 s heartbeat refreshes it with
// replace-only semantics, so a crashed instance's lease simply expires. A
// restart on the same host reclaims its own key instead of failing.
//
// The heartbeat never raises: every failure is logged and the next tick
// tries again. The in-memory status payload is the single source of truth —
// `record_error` works even after the key expired because it writes from
// memory rather than read-modify-write.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheService, SetMode, SetOutcome};
use crate::cache_keys::instance_status_key;
use crate::errors::{EngineError, EngineResult};
use crate::types::InstanceStatus;

/// Lease lifetime; three missed heartbeats lose the exchange.
pub const LEASE_TTL: Duration = Duration::from_secs(45);

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub struct InstanceRegistry {
    cache: Arc<dyn CacheService>,
    key: String,
    /// `"{hostname}:{exchangeId}:{pid}:{ms}"` — unique per process start.
    instance_id: String,
    hostname: String,
    status: Mutex<InstanceStatus>,
    registered: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceRegistry {
    pub fn new(
        cache: Arc<dyn CacheService>,
        exchange_id: impl Into<String>,
        exchange_name: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let exchange_id = exchange_id.into();
        let hostname = hostname.into();
        let now = Utc::now().timestamp_millis();

        let instance_id = format!(
            "{hostname}:{exchange_id}:{}:{now}",
            std::process::id()
        );

        let status = InstanceStatus {
            exchange_id: exchange_id.clone(),
            exchange_name: exchange_name.into(),
            hostname: hostname.clone(),
            ip_address: None,
            country_code: None,
            admin_email: None,
            admin_display_name: None,
            connection_state: Default::default(),
            symbol_count: 0,
            connected_at: None,
            last_heartbeat: now,
            last_state_change: now,
            registered_at: now,
            last_error: None,
            last_error_at: None,
        };

        Self {
            cache,
            key: instance_status_key(&exchange_id),
            instance_id,
            hostname,
            status: Mutex::new(status),
            registered: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Snapshot of the in-memory status payload.
    pub fn status(&self) -> InstanceStatus {
        self.status.lock().clone()
    }

    fn payload(&self) -> EngineResult<String> {
        let mut status = self.status.lock();
        status.last_heartbeat = Utc::now().timestamp_millis();
        serde_json::to_string(&*status)
            .map_err(|e| EngineError::Fatal(format!("status payload encode failed: {e}")))
    }

    // ── Lease claim ─────────────────────────────────────────────────────

    /// Atomically claim the exchange, or reclaim it after a self-restart.
    ///
    /// Fails with [`EngineError::LeaseConflict`] when a different host holds
    /// the key, carrying the existing holder's diagnostics and remaining TTL.
    pub async fn register(&self) -> EngineResult<()> {
        self.status.lock().registered_at = Utc::now().timestamp_millis();
        self.try_claim(true).await
    }

    async fn try_claim(&self, allow_retry: bool) -> EngineResult<()> {
        let payload = self.payload()?;

        let outcome = self
            .cache
            .kv_set(&self.key, &payload, SetMode::CreateOnly(LEASE_TTL))
            .await
            .map_err(|e| EngineError::TransientIo(format!("lease claim write: {e}")))?;

        if outcome == SetOutcome::Written {
            self.registered.store(true, Ordering::SeqCst);
            info!(key = %self.key, instance = %self.instance_id, "exchange lease claimed");
            return Ok(());
        }

        // Key exists — find out whose it is.
        let existing = self
            .cache
            .kv_get(&self.key)
            .await
            .map_err(|e| EngineError::TransientIo(format!("lease read: {e}")))?;

        let Some(raw) = existing else {
            // The key expired between the create attempt and the read. One
            // retry covers this race; a second miss is a real problem.
            if allow_retry {
                debug!(key = %self.key, "lease key vanished mid-claim, retrying once");
                return Box::pin(self.try_claim(false)).await;
            }
            return Err(EngineError::TransientIo(
                "lease key unstable during claim".to_string(),
            ));
        };

        let holder: InstanceStatus = serde_json::from_str(&raw).map_err(|e| {
            EngineError::LeaseConflict(format!(
                "exchange key {} is held by an unreadable payload ({e})",
                self.key
            ))
        })?;

        if holder.hostname == self.hostname {
            // Self-restart: the previous process on this host died without
            // deregistering. Take the key over in place.
            let outcome = self
                .cache
                .kv_set(&self.key, &payload, SetMode::ReplaceOnly(LEASE_TTL))
                .await
                .map_err(|e| EngineError::TransientIo(format!("lease reclaim write: {e}")))?;
            if outcome == SetOutcome::KeyMissing && allow_retry {
                return Box::pin(self.try_claim(false)).await;
            }
            self.registered.store(true, Ordering::SeqCst);
            info!(key = %self.key, instance = %self.instance_id, "exchange lease reclaimed after self-restart");
            return Ok(());
        }

        let ttl = self
            .cache
            .kv_ttl(&self.key)
            .await
            .ok()
            .flatten()
            .map_or_else(|| "unknown".to_string(), |d| format!("{}s", d.as_secs()));

        Err(EngineError::LeaseConflict(format!(
            "exchange {} is already owned by host {} (ip {}, connected_at {:?}, lease expires in {})",
            holder.exchange_id,
            holder.hostname,
            holder.ip_address.as_deref().unwrap_or("unknown"),
            holder.connected_at,
            ttl
        )))
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    /// Spawn the 15 s heartbeat loop. The task is aborted on
    /// [`deregister`](Self::deregister), so it never keeps the process
    /// alive.
    pub fn start_heartbeat(self: Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, we just registered.
            interval.tick().await;
            loop {
                interval.tick().await;
                this.heartbeat_tick().await;
            }
        });
        *self.heartbeat.lock() = Some(handle);
    }

    /// One heartbeat: replace-only refresh, re-register when the key is
    /// gone. Never raises.
    pub async fn heartbeat_tick(&self) {
        let payload = match self.payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "heartbeat payload encode failed");
                return;
            }
        };

        match self
            .cache
            .kv_set(&self.key, &payload, SetMode::ReplaceOnly(LEASE_TTL))
            .await
        {
            Ok(SetOutcome::Written) => {
                debug!(key = %self.key, "heartbeat");
            }
            Ok(_) => {
                warn!(key = %self.key, "lease key missing on heartbeat, re-registering");
                if let Err(e) = self.register().await {
                    warn!(error = %e, "re-registration after lost lease failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "heartbeat write failed");
            }
        }
    }

    // ── Status updates ──────────────────────────────────────────────────

    /// Merge a partial update into the in-memory payload and, while
    /// registered, write it back preserving the key's TTL. Unregistered
    /// instances never write (no ghost keys).
    pub async fn update_status(&self, patch: impl FnOnce(&mut InstanceStatus)) {
        let payload = {
            let mut status = self.status.lock();
            patch(&mut status);
            serde_json::to_string(&*status).ok()
        };

        if !self.is_registered() {
            return;
        }
        let Some(payload) = payload else {
            warn!("status payload encode failed on update");
            return;
        };
        if let Err(e) = self
            .cache
            .kv_set(&self.key, &payload, SetMode::KeepTtl)
            .await
        {
            warn!(error = %e, "status update write failed");
        }
    }

    /// Record an error on the status payload. Works from memory, so it
    /// succeeds even after the lease expired.
    pub async fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now().timestamp_millis();
        self.update_status(|s| {
            s.last_error = Some(message);
            s.last_error_at = Some(now);
        })
        .await;
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Stop the heartbeat and delete the lease key.
    pub async fn deregister(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.cache.kv_delete(std::slice::from_ref(&self.key)).await {
            warn!(error = %e, "lease delete failed on deregister");
        }
        self.registered.store(false, Ordering::SeqCst);
        info!(key = %self.key, "deregistered");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;

    fn cache() -> Arc<dyn CacheService> {
        Arc::new(MemoryCache::new())
    }

    fn registry(cache: &Arc<dyn CacheService>, host: &str) -> Arc<InstanceRegistry> {
        Arc::new(InstanceRegistry::new(
            cache.clone(),
            "coinbase",
            "Coinbase",
            host,
        ))
    }

    #[tokio::test]
    async fn register_claims_key_with_ttl() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        reg.register().await.unwrap();
        assert!(reg.is_registered());

        let ttl = cache
            .kv_ttl("exchange:coinbase:status")
            .await
            .unwrap()
            .expect("ttl");
        assert!(ttl <= LEASE_TTL);

        let raw = cache.kv_get("exchange:coinbase:status").await.unwrap().unwrap();
        let status: InstanceStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(status.hostname, "host-a");
        assert_eq!(status.exchange_id, "coinbase");
    }

    #[tokio::test]
    async fn self_restart_reclaims_lease() {
        let cache = cache();
        let first = registry(&cache, "host-a");
        first.register().await.unwrap();

        // A new process on the same host claims again without deregistering.
        let second = registry(&cache, "host-a");
        second.register().await.unwrap();
        assert!(second.is_registered());
        assert_ne!(first.instance_id(), second.instance_id());
    }

    #[tokio::test]
    async fn foreign_host_conflict_is_descriptive() {
        let cache = cache();
        registry(&cache, "host-a").register().await.unwrap();

        let err = registry(&cache, "host-b").register().await.unwrap_err();
        match err {
            EngineError::LeaseConflict(msg) => {
                assert!(msg.contains("host-a"), "message names the holder: {msg}");
                assert!(msg.contains("expires in"), "message carries the TTL: {msg}");
            }
            other => panic!("expected LeaseConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_refreshes_ttl_and_recovers_lost_key() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        reg.register().await.unwrap();

        reg.heartbeat_tick().await;
        let ttl = cache
            .kv_ttl("exchange:coinbase:status")
            .await
            .unwrap()
            .expect("ttl after heartbeat");
        assert!(ttl <= LEASE_TTL);

        // Key gone (e.g. cache flush): the next tick re-registers.
        cache
            .kv_delete(&["exchange:coinbase:status".to_string()])
            .await
            .unwrap();
        reg.heartbeat_tick().await;
        assert!(cache
            .kv_get("exchange:coinbase:status")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn update_status_skips_when_unregistered() {
        let cache = cache();
        let reg = registry(&cache, "host-a");

        reg.update_status(|s| s.symbol_count = 7).await;
        // Merged in memory...
        assert_eq!(reg.status().symbol_count, 7);
        // ...but no ghost key was written.
        assert!(cache
            .kv_get("exchange:coinbase:status")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_status_preserves_ttl_when_registered() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        reg.register().await.unwrap();

        reg.update_status(|s| s.symbol_count = 3).await;
        let raw = cache.kv_get("exchange:coinbase:status").await.unwrap().unwrap();
        let status: InstanceStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(status.symbol_count, 3);
        // TTL still present (keep-ttl write).
        assert!(cache
            .kv_ttl("exchange:coinbase:status")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn record_error_survives_expiry() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        // Never registered — the key does not exist, but memory still works.
        reg.record_error("stream went away").await;
        let status = reg.status();
        assert_eq!(status.last_error.as_deref(), Some("stream went away"));
        assert!(status.last_error_at.is_some());
    }

    #[tokio::test]
    async fn deregister_deletes_key() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        reg.register().await.unwrap();
        reg.deregister().await;
        assert!(!reg.is_registered());
        assert!(cache
            .kv_get("exchange:coinbase:status")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn instance_id_embeds_host_exchange_pid() {
        let cache = cache();
        let reg = registry(&cache, "host-a");
        let id = reg.instance_id();
        assert!(id.starts_with("host-a:coinbase:"));
        assert!(id.contains(&std::process::id().to_string()));
    }
}
