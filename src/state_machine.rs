// =============================================================================
// Connection state machine
// =============================================================================
//
// Guards the instance lifecycle:
//
//   idle -> starting -> warming -> active -> stopping -> stopped
//                \---------\--------------------^   \-> idle
//   stopped -> starting | idle
//
// Anything else is an illegal transition and raises `StateInvalid`. Every
// accepted transition lands in a capped history, is mirrored into the
// registry payload, and notifies the in-process observer (the supervisor's
// runtime view). `reset_to_idle` bypasses validation for crash recovery.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::registry::InstanceRegistry;
use crate::types::ConnectionState;

/// Transitions kept in history (FIFO).
pub const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

type StateObserver = Box<dyn Fn(ConnectionState) + Send + Sync>;

pub struct ConnectionStateMachine {
    registry: Arc<InstanceRegistry>,
    current: Mutex<ConnectionState>,
    history: Mutex<VecDeque<TransitionRecord>>,
    observer: RwLock<Option<StateObserver>>,
}

/// The full transition table. Everything not listed is illegal.
fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Idle, Starting)
            | (Starting, Warming)
            | (Starting, Stopping)
            | (Warming, Active)
            | (Warming, Stopping)
            | (Active, Stopping)
            | (Stopping, Stopped)
            | (Stopping, Idle)
            | (Stopped, Starting)
            | (Stopped, Idle)
    )
}

impl ConnectionStateMachine {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            current: Mutex::new(ConnectionState::Idle),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            observer: RwLock::new(None),
        }
    }

    /// Register the single in-process observer (replaces any previous one).
    pub fn on_change(&self, observer: impl Fn(ConnectionState) + Send + Sync + 'static) {
        *self.observer.write() = Some(Box::new(observer));
    }

    pub fn current(&self) -> ConnectionState {
        *self.current.lock()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Validated transition. Fails with `StateInvalid` on an illegal edge.
    pub async fn transition(&self, to: ConnectionState) -> EngineResult<()> {
        let from = {
            let mut current = self.current.lock();
            let from = *current;
            if !allowed(from, to) {
                return Err(EngineError::StateInvalid(format!(
                    "cannot transition {from} -> {to}"
                )));
            }
            *current = to;
            from
        };
        self.commit(from, to).await;
        Ok(())
    }

    /// Unvalidated escape hatch for crash recovery.
    pub async fn reset_to_idle(&self) {
        let from = {
            let mut current = self.current.lock();
            let from = *current;
            *current = ConnectionState::Idle;
            from
        };
        warn!(from = %from, "connection state force-reset to idle");
        self.commit(from, ConnectionState::Idle).await;
    }

    async fn commit(&self, from: ConnectionState, to: ConnectionState) {
        let at = Utc::now();
        {
            let mut history = self.history.lock();
            history.push_back(TransitionRecord { from, to, at });
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }

        let now_ms = at.timestamp_millis();
        self.registry
            .update_status(move |s| {
                s.connection_state = to;
                s.last_state_change = now_ms;
                if to == ConnectionState::Active {
                    s.connected_at = Some(now_ms);
                }
            })
            .await;

        if let Some(observer) = self.observer.read().as_ref() {
            observer(to);
        }

        info!(from = %from, to = %to, "connection state changed");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::cache::CacheService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn machine() -> ConnectionStateMachine {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let registry = Arc::new(InstanceRegistry::new(cache, "coinbase", "Coinbase", "host"));
        ConnectionStateMachine::new(registry)
    }

    #[tokio::test]
    async fn full_lifecycle_is_legal() {
        use ConnectionState::*;
        let sm = machine();
        for state in [Starting, Warming, Active, Stopping, Stopped, Starting] {
            sm.transition(state).await.unwrap();
        }
        assert_eq!(sm.current(), Starting);
    }

    #[tokio::test]
    async fn illegal_edges_are_rejected() {
        use ConnectionState::*;
        let sm = machine();
        // idle -> active skips two states.
        let err = sm.transition(Active).await.unwrap_err();
        assert!(matches!(err, EngineError::StateInvalid(_)));
        // State unchanged after a rejected transition.
        assert_eq!(sm.current(), Idle);

        sm.transition(Starting).await.unwrap();
        assert!(sm.transition(Stopped).await.is_err());
        assert!(sm.transition(Idle).await.is_err());
    }

    #[tokio::test]
    async fn abort_paths_are_legal() {
        use ConnectionState::*;
        let sm = machine();
        sm.transition(Starting).await.unwrap();
        sm.transition(Stopping).await.unwrap();
        sm.transition(Idle).await.unwrap();
        assert_eq!(sm.current(), Idle);
    }

    #[tokio::test]
    async fn history_records_and_caps() {
        use ConnectionState::*;
        let sm = machine();
        // Bounce starting <-> stopping/idle enough to overflow the cap.
        for _ in 0..30 {
            sm.transition(Starting).await.unwrap();
            sm.transition(Stopping).await.unwrap();
            sm.transition(Idle).await.unwrap();
        }
        let history = sm.history();
        assert_eq!(history.len(), HISTORY_CAP);
        // Oldest entries were evicted: the first record is not the very
        // first transition.
        assert_eq!(history.last().map(|r| r.to), Some(Idle));
    }

    #[tokio::test]
    async fn reset_to_idle_bypasses_validation() {
        use ConnectionState::*;
        let sm = machine();
        sm.transition(Starting).await.unwrap();
        sm.transition(Warming).await.unwrap();
        sm.transition(Active).await.unwrap();

        // active -> idle is not a legal edge, but the escape hatch allows it.
        sm.reset_to_idle().await;
        assert_eq!(sm.current(), Idle);
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        use ConnectionState::*;
        let sm = machine();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        sm.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sm.transition(Starting).await.unwrap();
        sm.transition(Warming).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registry_mirrors_state_and_connected_at() {
        use ConnectionState::*;
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            "coinbase",
            "Coinbase",
            "host",
        ));
        registry.register().await.unwrap();
        let sm = ConnectionStateMachine::new(registry.clone());

        sm.transition(Starting).await.unwrap();
        sm.transition(Warming).await.unwrap();
        assert!(registry.status().connected_at.is_none());

        sm.transition(Active).await.unwrap();
        let status = registry.status();
        assert_eq!(status.connection_state, Active);
        assert!(status.connected_at.is_some());
    }
}
