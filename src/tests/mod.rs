
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
mod test_redis_counter_store;
mod test_throttle;
