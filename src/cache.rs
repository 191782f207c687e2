//! Bounded, TTL-based cache for event-derived reads.
//!
//! Eviction removes the entry with the fewest hits, breaking ties by the
//! oldest timestamp. Frequently read entries survive a burst of one-off
//! inserts that plain LRU would let push them out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::telemetry::metric_inc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_size: usize,

    /// Entries older than this are treated as absent.
    pub ttl_ms: u64,

    /// Period of the background expiry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            ttl_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
}

struct CacheEntry<T> {
    data: T,
    timestamp: DateTime<Utc>,
    hit_count: u64,
    // Insertion order, the final tie-breaker for eviction.
    seq: u64,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    next_seq: u64,
}

pub struct EventCache<T> {
    inner: Mutex<CacheInner<T>>,
    max_size: usize,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> EventCache<T> {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let ttl_ms = i64::try_from(config.ttl_ms).unwrap_or(i64::MAX);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                next_seq: 0,
            }),
            max_size: config.max_size.max(1),
            ttl: chrono::Duration::milliseconds(ttl_ms),
            clock,
        }
    }

    /// Look up `key`, removing it if it has expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                metric_inc("automation.cache.miss");
                return None;
            }
            Some(entry) => self.is_expired(entry, now),
        };

        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            metric_inc("automation.cache.miss");
            return None;
        }

        inner.hits += 1;
        metric_inc("automation.cache.hit");
        let entry = inner.entries.get_mut(key)?;
        entry.hit_count += 1;
        Some(entry.data.clone())
    }

    /// Insert or overwrite `key`.
    ///
    /// Inserting a new key into a full cache evicts exactly one existing
    /// entry first. Overwriting starts the entry afresh.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            if let Some(victim) = eviction_candidate(&inner.entries) {
                inner.entries.remove(&victim);
                inner.evictions += 1;
                metric_inc("automation.cache.eviction");
                tracing::trace!(key = %victim, "evicted cache entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                data: value,
                timestamp: now,
                hit_count: 0,
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| now.signed_duration_since(entry.timestamp) <= self.ttl);
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.timestamp) > self.ttl
    }
}

impl<T: Clone + Send + 'static> EventCache<T> {
    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

fn eviction_candidate<T>(entries: &HashMap<String, CacheEntry<T>>) -> Option<String> {
    entries
        .iter()
        .min_by_key(|(_, entry)| (entry.hit_count, entry.timestamp, entry.seq))
        .map(|(key, _)| key.clone())
}
