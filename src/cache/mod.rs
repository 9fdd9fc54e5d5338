// =============================================================================
// Cache service — the shared backbone every subsystem talks through
// =============================================================================
//
// One trait covers everything the engine needs from its cache: score-ordered
// sets (candles, the command queue), keyed strings with TTL write modes (the
// lease, latest indicator/ticker values), glob pub/sub (candle-close /
// indicator / ticker / command topics), and trimmed append-only streams (the
// activity log).
//
// Failures propagate as `CacheError` values. Subsystems decide per the error
// policy whether to log-and-continue or give up.
// =============================================================================

pub mod memory;
pub mod strategies;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend cannot be reached at all.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    /// A single operation failed; the backend itself may be fine.
    #[error("cache operation failed: {0}")]
    Operation(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// Value shapes
// =============================================================================

/// One entry of a score-ordered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub score: i64,
    pub member: String,
}

impl ScoredMember {
    pub fn new(score: i64, member: impl Into<String>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

/// Write mode for keyed string values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Write only when the key does not exist; sets the given TTL.
    CreateOnly(Duration),
    /// Write only when the key already exists; resets the TTL.
    ReplaceOnly(Duration),
    /// Write unconditionally, preserving whatever TTL the key carries.
    KeepTtl,
    /// Write unconditionally with the given TTL (`None` = no expiry).
    WithTtl(Option<Duration>),
}

/// What a conditional `kv_set` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Written,
    /// Create-only write found an existing key.
    NotCreated,
    /// Replace-only write found no key.
    KeyMissing,
}

/// A message delivered to a pattern subscription.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: String,
}

/// Live pattern subscription. Dropping it detaches from the backend; the
/// next publish prunes the dead receiver.
pub struct Subscription {
    pub(crate) rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    /// Wait for the next matching message. `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    /// Stop accepting new messages; already-buffered ones still drain.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// =============================================================================
// The service trait
// =============================================================================

#[async_trait]
pub trait CacheService: Send + Sync {
    // ── Score-ordered sets ──────────────────────────────────────────────

    /// Insert entries; an identical (score, member) pair is a no-op.
    async fn sorted_add(&self, key: &str, entries: &[ScoredMember]) -> CacheResult<usize>;

    /// Remove every member carrying one of the given scores.
    async fn sorted_remove_by_score(&self, key: &str, scores: &[i64]) -> CacheResult<usize>;

    /// The highest-scored `count` entries, returned in ascending score order.
    async fn sorted_tail(&self, key: &str, count: usize) -> CacheResult<Vec<ScoredMember>>;

    async fn sorted_len(&self, key: &str) -> CacheResult<usize>;

    /// Evict lowest-scored entries until at most `max_len` remain.
    async fn sorted_trim_to(&self, key: &str, max_len: usize) -> CacheResult<usize>;

    /// Pop the single lowest-scored entry, if any.
    async fn sorted_pop_min(&self, key: &str) -> CacheResult<Option<ScoredMember>>;

    // ── Keyed strings ───────────────────────────────────────────────────

    async fn kv_set(&self, key: &str, value: &str, mode: SetMode) -> CacheResult<SetOutcome>;
    async fn kv_get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Fetch many keys in one backend round-trip; order mirrors `keys`.
    async fn kv_get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Delete the given keys. Callers batch large sets (see
    /// [`strategies::delete_keys_batched`]); this call never receives an
    /// unbounded key list.
    async fn kv_delete(&self, keys: &[String]) -> CacheResult<usize>;

    /// Remaining TTL, `None` when the key has no expiry or does not exist.
    async fn kv_ttl(&self, key: &str) -> CacheResult<Option<Duration>>;

    /// Enumerate keys matching a `*` glob.
    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    // ── Pub/sub ─────────────────────────────────────────────────────────

    /// Deliver `payload` to every subscription matching `topic`. Returns the
    /// receiver count.
    async fn publish(&self, topic: &str, payload: &str) -> CacheResult<usize>;

    /// Subscribe to one or more `*` glob patterns.
    async fn subscribe(&self, patterns: &[String]) -> CacheResult<Subscription>;

    // ── Append-only streams ─────────────────────────────────────────────

    /// Append an entry; returns its id (`"{ms}-{seq}"`).
    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> CacheResult<String>;

    /// Drop every entry with an id strictly below `min_id`.
    async fn stream_trim_min_id(&self, key: &str, min_id: &str) -> CacheResult<usize>;

    /// Number of entries currently in the stream.
    async fn stream_len(&self, key: &str) -> CacheResult<usize>;
}

// =============================================================================
// Glob matching
// =============================================================================

/// Match `text` against a pattern where `*` spans any run of characters.
/// Everything else matches literally. This is the full pattern language the
/// engine's topics need.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    // Classic two-pointer wildcard match with backtracking to the last `*`.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
