use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{CounterKey, CounterStore, TrammelError};

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`CounterStore`] backed by a [`DashMap`](dashmap::DashMap).
///
/// Mirrors the Redis semantics the throttle relies on:
///
/// - Absent and expired keys read as `0`
/// - `increment` on an absent key creates it at `1`
/// - `decrement` on an absent key yields `-1`
/// - `increment_with_expiry` sets the expiry to `now + ttl` on every call;
///   plain `increment`/`decrement` keep whatever expiry the key already has
/// - A ttl that overflows the clock leaves the key without an expiry
///
/// Expired entries are evicted lazily when touched, or in bulk by
/// [`purge_expired`](Self::purge_expired).
///
/// State is process-scoped: share one instance (e.g. behind an `Arc`) between the
/// throttles that should share a bound.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, CounterEntry>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns `true` if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns `true` if `key` is present and not expired.
    pub fn contains(&self, key: &CounterKey) -> bool {
        let now = Instant::now();
        self.counters
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, entry| !entry.is_expired(now));
    }

    fn add(&self, key: &CounterKey, delta: i64, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();

        match self.counters.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CounterEntry {
                        value: 0,
                        expires_at: None,
                    };
                }

                entry.value += delta;
                if let Some(ttl) = ttl {
                    entry.expires_at = now.checked_add(ttl);
                }

                entry.value
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CounterEntry {
                    value: delta,
                    expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                });

                delta
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        let now = Instant::now();

        let value = match self.counters.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value),
            Some(_) => None,
            None => return Ok(0),
        };

        match value {
            Some(value) => Ok(value),
            None => {
                self.counters
                    .remove_if(key, |_, entry| entry.is_expired(now));
                Ok(0)
            }
        }
    }

    async fn increment(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        Ok(self.add(key, 1, None))
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        Ok(self.add(key, -1, None))
    }

    async fn delete(&self, key: &CounterKey) -> Result<(), TrammelError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<i64, TrammelError> {
        Ok(self.add(key, 1, Some(ttl)))
    }
}
