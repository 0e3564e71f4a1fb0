//! Shared counter stores.
//!
//! A throttle coordinates with every other throttle using the same key purely
//! through a [`CounterStore`]. The store must make each individual operation atomic;
//! the throttle never needs multi-key transactions, locks or pub/sub.
//!
//! - [`MemoryCounterStore`]: in-process, for single-process deployments and tests
//! - `RedisCounterStore`: Redis-backed, shared across processes and hosts
//!   (requires the `redis-tokio` or `redis-smol` feature)

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{CounterKey, TrammelError};

mod memory_counter_store;
pub use memory_counter_store::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
mod redis_counter_store;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub use redis_counter_store::*;

/// An external key-value store holding shared integer counters.
///
/// Every method is a single atomic operation on one key. Increments and decrements
/// issued from different processes must serialize correctly; that is the store's
/// job, not the throttle's.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Current value of `key`, or `0` if the key is absent.
    async fn get(&self, key: &CounterKey) -> Result<i64, TrammelError>;

    /// Atomically add 1 and return the new value. An absent key is created at 1.
    async fn increment(&self, key: &CounterKey) -> Result<i64, TrammelError>;

    /// Atomically subtract 1 and return the new value. The result may be negative.
    async fn decrement(&self, key: &CounterKey) -> Result<i64, TrammelError>;

    /// Remove `key`.
    async fn delete(&self, key: &CounterKey) -> Result<(), TrammelError>;

    /// Atomically add 1 and set (or refresh) a time-to-live of `ttl` on `key`,
    /// returning the post-increment value.
    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<i64, TrammelError>;
}

#[async_trait]
impl<S: CounterStore> CounterStore for Arc<S> {
    async fn get(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        (**self).get(key).await
    }

    async fn increment(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        (**self).increment(key).await
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        (**self).decrement(key).await
    }

    async fn delete(&self, key: &CounterKey) -> Result<(), TrammelError> {
        (**self).delete(key).await
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<i64, TrammelError> {
        (**self).increment_with_expiry(key, ttl).await
    }
}
