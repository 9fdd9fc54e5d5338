// =============================================================================
// In-memory cache service
// =============================================================================
//
// Backs tests and single-process deployments. Sorted sets are `BTreeSet`s of
// (score, member) pairs, TTLs expire lazily on access, and pub/sub fans out
// over unbounded mpsc channels with dead receivers pruned on the next
// publish. Every operation completes without suspending, so no lock is ever
// held across an await point.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{
    glob_match, CacheResult, CacheService, PubSubMessage, ScoredMember, SetMode, SetOutcome,
    Subscription,
};

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

type StreamId = (i64, u64);

struct StreamState {
    entries: Vec<(StreamId, Vec<(String, String)>)>,
    last_id: StreamId,
}

struct SubEntry {
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

/// Process-local implementation of [`CacheService`].
#[derive(Default)]
pub struct MemoryCache {
    kv: RwLock<HashMap<String, KvEntry>>,
    sorted: RwLock<HashMap<String, BTreeSet<(i64, String)>>>,
    streams: RwLock<HashMap<String, StreamState>>,
    subscribers: RwLock<Vec<SubEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn id_string((ms, seq): StreamId) -> String {
    format!("{ms}-{seq}")
}

/// Parse a `"{ms}"` or `"{ms}-{seq}"` stream id.
fn parse_id(raw: &str) -> Option<StreamId> {
    match raw.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((raw.parse().ok()?, 0)),
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    // ── Score-ordered sets ──────────────────────────────────────────────

    async fn sorted_add(&self, key: &str, entries: &[ScoredMember]) -> CacheResult<usize> {
        let mut map = self.sorted.write();
        let set = map.entry(key.to_string()).or_default();
        let mut added = 0;
        for e in entries {
            if set.insert((e.score, e.member.clone())) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn sorted_remove_by_score(&self, key: &str, scores: &[i64]) -> CacheResult<usize> {
        let mut map = self.sorted.write();
        let Some(set) = map.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(score, _)| !scores.contains(score));
        Ok(before - set.len())
    }

    async fn sorted_tail(&self, key: &str, count: usize) -> CacheResult<Vec<ScoredMember>> {
        let map = self.sorted.read();
        let Some(set) = map.get(key) else {
            return Ok(Vec::new());
        };
        let mut tail: Vec<ScoredMember> = set
            .iter()
            .rev()
            .take(count)
            .map(|(score, member)| ScoredMember::new(*score, member.clone()))
            .collect();
        tail.reverse();
        Ok(tail)
    }

    async fn sorted_len(&self, key: &str) -> CacheResult<usize> {
        Ok(self.sorted.read().get(key).map_or(0, BTreeSet::len))
    }

    async fn sorted_trim_to(&self, key: &str, max_len: usize) -> CacheResult<usize> {
        let mut map = self.sorted.write();
        let Some(set) = map.get_mut(key) else {
            return Ok(0);
        };
        let mut evicted = 0;
        while set.len() > max_len {
            let lowest = set.iter().next().cloned();
            match lowest {
                Some(entry) => {
                    set.remove(&entry);
                    evicted += 1;
                }
                None => break,
            }
        }
        Ok(evicted)
    }

    async fn sorted_pop_min(&self, key: &str) -> CacheResult<Option<ScoredMember>> {
        let mut map = self.sorted.write();
        let Some(set) = map.get_mut(key) else {
            return Ok(None);
        };
        let lowest = set.iter().next().cloned();
        Ok(lowest.map(|entry| {
            set.remove(&entry);
            ScoredMember::new(entry.0, entry.1)
        }))
    }

    // ── Keyed strings ───────────────────────────────────────────────────

    async fn kv_set(&self, key: &str, value: &str, mode: SetMode) -> CacheResult<SetOutcome> {
        let mut map = self.kv.write();
        let exists = map.get(key).is_some_and(KvEntry::live);

        let outcome = match mode {
            SetMode::CreateOnly(ttl) => {
                if exists {
                    SetOutcome::NotCreated
                } else {
                    map.insert(
                        key.to_string(),
                        KvEntry {
                            value: value.to_string(),
                            expires_at: Some(Instant::now() + ttl),
                        },
                    );
                    SetOutcome::Written
                }
            }
            SetMode::ReplaceOnly(ttl) => {
                if exists {
                    map.insert(
                        key.to_string(),
                        KvEntry {
                            value: value.to_string(),
                            expires_at: Some(Instant::now() + ttl),
                        },
                    );
                    SetOutcome::Written
                } else {
                    SetOutcome::KeyMissing
                }
            }
            SetMode::KeepTtl => {
                let expires_at = map.get(key).filter(|e| e.live()).and_then(|e| e.expires_at);
                map.insert(
                    key.to_string(),
                    KvEntry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
                SetOutcome::Written
            }
            SetMode::WithTtl(ttl) => {
                map.insert(
                    key.to_string(),
                    KvEntry {
                        value: value.to_string(),
                        expires_at: ttl.map(|d| Instant::now() + d),
                    },
                );
                SetOutcome::Written
            }
        };
        Ok(outcome)
    }

    async fn kv_get(&self, key: &str) -> CacheResult<Option<String>> {
        let map = self.kv.read();
        Ok(map
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn kv_get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        let map = self.kv.read();
        Ok(keys
            .iter()
            .map(|k| map.get(k).filter(|e| e.live()).map(|e| e.value.clone()))
            .collect())
    }

    async fn kv_delete(&self, keys: &[String]) -> CacheResult<usize> {
        // Deletion is type-agnostic: a key may name a string value or a
        // sorted set.
        let mut kv = self.kv.write();
        let mut sorted = self.sorted.write();
        let mut removed = 0;
        for k in keys {
            if kv.remove(k).is_some_and(|e| e.live()) {
                removed += 1;
            } else if sorted.remove(k).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn kv_ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let map = self.kv.read();
        Ok(map
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.expires_at)
            .map(|deadline| deadline.saturating_duration_since(Instant::now())))
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let map = self.kv.read();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, e)| e.live() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        // Sorted-set keys are scannable too (clear-cache sweeps candles).
        let sorted = self.sorted.read();
        keys.extend(
            sorted
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned(),
        );
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    // ── Pub/sub ─────────────────────────────────────────────────────────

    async fn publish(&self, topic: &str, payload: &str) -> CacheResult<usize> {
        let mut subs = self.subscribers.write();
        let mut delivered = 0;
        subs.retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if sub.patterns.iter().any(|p| glob_match(p, topic)) {
                let ok = sub
                    .tx
                    .send(PubSubMessage {
                        topic: topic.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok();
                if ok {
                    delivered += 1;
                }
                return ok;
            }
            true
        });
        Ok(delivered)
    }

    async fn subscribe(&self, patterns: &[String]) -> CacheResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(SubEntry {
            patterns: patterns.to_vec(),
            tx,
        });
        Ok(Subscription { rx })
    }

    // ── Append-only streams ─────────────────────────────────────────────

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> CacheResult<String> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut map = self.streams.write();
        let state = map.entry(key.to_string()).or_insert_with(|| StreamState {
            entries: Vec::new(),
            last_id: (0, 0),
        });

        // Ids are monotonic even when the clock stalls within one millisecond.
        let id = if now_ms > state.last_id.0 {
            (now_ms, 0)
        } else {
            (state.last_id.0, state.last_id.1 + 1)
        };
        state.last_id = id;
        state.entries.push((id, fields.to_vec()));
        Ok(id_string(id))
    }

    async fn stream_trim_min_id(&self, key: &str, min_id: &str) -> CacheResult<usize> {
        let Some(min) = parse_id(min_id) else {
            return Ok(0);
        };
        let mut map = self.streams.write();
        let Some(state) = map.get_mut(key) else {
            return Ok(0);
        };
        let before = state.entries.len();
        state.entries.retain(|(id, _)| *id >= min);
        Ok(before - state.entries.len())
    }

    async fn stream_len(&self, key: &str) -> CacheResult<usize> {
        Ok(self
            .streams
            .read()
            .get(key)
            .map_or(0, |s| s.entries.len()))
    }
}
