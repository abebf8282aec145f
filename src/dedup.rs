//! In-process webhook delivery deduplication.
//!
//! Chat platforms redeliver the same logical event through multiple event
//! types (a plain message and an at-mention can share one underlying id)
//! and retry deliveries that are acknowledged too slowly. This cache is
//! the fast-path filter for those duplicates within a single process.
//!
//! It is best-effort only: the durable processed-message record in the
//! store is the idempotency source of truth across processes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default maximum number of tracked keys.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Bounded TTL-based "have I seen this key" set.
pub struct DedupCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Set the entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum number of tracked keys.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Record a key. Returns `true` if the key was already present and
    /// unexpired (a duplicate delivery), `false` if it was newly inserted.
    pub fn mark(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().expect("dedup mutex poisoned");
        let now = Instant::now();

        if let Some(seen_at) = entries.get(key) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
            entries.remove(key);
        }

        entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        // Under a pathological burst the TTL sweep is not enough; drop
        // the oldest ~10% to bound memory.
        if entries.len() >= self.max_entries {
            let evict = (self.max_entries / 10).max(1);
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, seen_at)| *seen_at);
            for (key, _) in by_age.into_iter().take(evict) {
                entries.remove(&key);
            }
        }

        entries.insert(key.to_string(), now);
        false
    }

    /// Number of tracked keys, expired entries included.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("dedup mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
