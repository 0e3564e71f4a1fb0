use std::{env, time::Duration};

use redis::AsyncCommands;

use crate::{CounterKey, CounterStore, RedisCounterStore, TrammelError};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_key(name: &str) -> CounterKey {
    let n: u64 = rand::random();
    CounterKey::try_from(format!("trammel_test:{n}:{name}")).unwrap()
}

async fn build_store(url: &str) -> (RedisCounterStore, redis::aio::ConnectionManager) {
    let client = redis::Client::open(url).unwrap();
    let cm = client.get_connection_manager().await.unwrap();
    let store = RedisCounterStore::from_client(client, 2).await.unwrap();

    (store, cm)
}

#[test]
fn rejects_zero_connections() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let err = RedisCounterStore::from_client(client, 0).await.unwrap_err();
        assert!(matches!(err, TrammelError::InvalidConnectionCount(_)));
    });
}

#[test]
fn counter_operations_follow_redis_semantics() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, mut cm) = build_store(&url).await;
        let k = unique_key("ops");

        assert_eq!(store.get(&k).await.unwrap(), 0);
        assert_eq!(store.increment(&k).await.unwrap(), 1);
        assert_eq!(store.increment(&k).await.unwrap(), 2);
        assert_eq!(store.decrement(&k).await.unwrap(), 1);
        assert_eq!(store.get(&k).await.unwrap(), 1);

        // Plain increments never attach a ttl.
        let pttl: i64 = cm.pttl(k.as_str()).await.unwrap();
        assert_eq!(pttl, -1);

        store.delete(&k).await.unwrap();
        let exists: bool = cm.exists(k.as_str()).await.unwrap();
        assert!(!exists);

        assert_eq!(store.decrement(&k).await.unwrap(), -1);
        store.delete(&k).await.unwrap();
    });
}

#[test]
fn increment_with_expiry_sets_ttl_and_expires() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, mut cm) = build_store(&url).await;
        let k = unique_key("ttl");

        let ttl = Duration::from_millis(300);
        assert_eq!(store.increment_with_expiry(&k, ttl).await.unwrap(), 1);
        assert_eq!(store.increment_with_expiry(&k, ttl).await.unwrap(), 2);

        let pttl: i64 = cm.pttl(k.as_str()).await.unwrap();
        assert!(pttl > 0 && pttl <= 300, "pttl = {pttl}");

        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(store.get(&k).await.unwrap(), 0);
        let exists: bool = cm.exists(k.as_str()).await.unwrap();
        assert!(!exists);
    });
}

#[test]
fn non_integer_value_is_an_unexpected_reply() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, mut cm) = build_store(&url).await;
        let k = unique_key("garbage");

        let _: () = cm.set(k.as_str(), "not-a-number").await.unwrap();

        assert!(matches!(
            store.get(&k).await,
            Err(TrammelError::UnexpectedReply(_))
        ));

        store.delete(&k).await.unwrap();
    });
}
