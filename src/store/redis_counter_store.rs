use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use crate::{CounterKey, CounterStore, TrammelError};

const INCREMENT_WITH_EXPIRY_SCRIPT: &str = r#"
    local value = redis.call("INCR", KEYS[1])
    redis.call("PEXPIRE", KEYS[1], ARGV[1])

    return value
"#;

/// Redis-backed [`CounterStore`].
///
/// Holds one or more [`redis::aio::ConnectionManager`]s and hands them out
/// round-robin. Each counter operation is a single Redis command, except
/// `increment_with_expiry`, which runs `INCR` + `PEXPIRE` in one Lua script so both
/// happen atomically.
///
/// # Requirements
///
/// - **Redis version:** any version with `EVALSHA` (>= 2.6)
/// - **Runtime:** Tokio or Smol (via `redis-tokio` or `redis-smol` features)
///
/// # Examples
///
/// ```ignore
/// use trammel::RedisCounterStore;
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let store = RedisCounterStore::from_client(client, 4).await?;
/// ```
pub struct RedisCounterStore {
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
    increment_with_expiry_script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connection_count", &self.connection_managers.len())
            .field("track_index", &self.track_index)
            .field("increment_with_expiry_script", &self.increment_with_expiry_script)
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store with a single connection manager from `client`.
    pub async fn default_from_client(client: Client) -> Result<Self, TrammelError> {
        Self::from_client(client, 1).await
    }

    /// Create a store with `connection_count` connection managers from `client`.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, TrammelError> {
        if connection_count == 0 {
            return Err(TrammelError::InvalidConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connection_managers.push(client.get_connection_manager().await?);
        }

        Ok(Self::from_connection_managers(connection_managers))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self::from_connection_managers(vec![connection_manager])
    }

    fn from_connection_managers(connection_managers: Vec<ConnectionManager>) -> Self {
        Self {
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
            increment_with_expiry_script: Script::new(INCREMENT_WITH_EXPIRY_SCRIPT),
        }
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    } // end method connection
} // end impl RedisCounterStore

impl Clone for RedisCounterStore {
    fn clone(&self) -> Self {
        Self {
            connection_managers: self.connection_managers.clone(),
            track_index: AtomicUsize::new(0),
            increment_with_expiry_script: self.increment_with_expiry_script.clone(),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        let mut connection_manager = self.connection();
        let value: Option<String> = connection_manager.get(key.as_str()).await?;

        match value {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                TrammelError::UnexpectedReply(format!(
                    "value at {key} is not an integer counter: {raw:?}"
                ))
            }),
        }
    }

    async fn increment(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        let mut connection_manager = self.connection();
        let value: i64 = connection_manager.incr(key.as_str(), 1i64).await?;
        Ok(value)
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, TrammelError> {
        let mut connection_manager = self.connection();
        let value: i64 = connection_manager.decr(key.as_str(), 1i64).await?;
        Ok(value)
    }

    async fn delete(&self, key: &CounterKey) -> Result<(), TrammelError> {
        let mut connection_manager = self.connection();
        let _: u64 = connection_manager.del(key.as_str()).await?;
        Ok(())
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<i64, TrammelError> {
        let mut connection_manager = self.connection();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let value: i64 = self
            .increment_with_expiry_script
            .key(key.as_str())
            .arg(ttl_ms)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(value)
    }
}
