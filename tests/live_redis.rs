//! Runs against a real Redis/Valkey when `MQBRIDGE_TEST_REDIS_URL` is set:
//! `MQBRIDGE_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use mqbridge::cache::{CacheBackendKind, CacheConfig, CacheStore, RedisStore};
use serde_json::json;
use uuid::Uuid;

fn redis_config() -> Option<CacheConfig> {
    let url = std::env::var("MQBRIDGE_TEST_REDIS_URL").ok()?;
    Some(CacheConfig {
        backend: CacheBackendKind::Redis,
        redis_url: Some(url),
        prefix: format!("mqbridge-test-{}", Uuid::new_v4().simple()),
        ..CacheConfig::default()
    })
}

#[tokio::test]
#[ignore = "requires MQBRIDGE_TEST_REDIS_URL"]
async fn redis_store_round_trips_and_lists() {
    let Some(config) = redis_config() else {
        eprintln!("MQBRIDGE_TEST_REDIS_URL not set; skipping");
        return;
    };
    let store = RedisStore::connect(&config).await.expect("redis reachable");

    store.write("sensors", "temp1", json!({"v": 21})).await;
    store.write("sensors", "temp2", json!(19)).await;
    store.write("leds", "active", json!({"value": true})).await;

    let record = store.read("sensors", "temp1").await.expect("record stored");
    assert_eq!(record.entry, json!({"v": 21}));
    assert!(record.meta.is_some());

    let scalar = store.read("sensors", "temp2").await.expect("record stored");
    assert!(scalar.meta.is_none());

    assert!(store.read("sensors", "missing").await.is_none());

    let mut raw = redis::Client::open(config.redis_url.as_deref().expect("url"))
        .expect("valid url")
        .get_multiplexed_async_connection()
        .await
        .expect("raw connection");
    let garbage_key = format!("{}:sensors:garbage", config.prefix);
    redis::AsyncCommands::set::<_, _, ()>(&mut raw, &garbage_key, "{not a record")
        .await
        .expect("raw set");
    assert!(store.read("sensors", "garbage").await.is_none());
    redis::AsyncCommands::del::<_, ()>(&mut raw, &garbage_key)
        .await
        .expect("raw del");

    let categories: Vec<String> = store.categories().await.into_iter().collect();
    assert_eq!(categories, vec!["leds", "sensors"]);
    let entries: Vec<String> = store.entries("sensors").await.into_iter().collect();
    assert_eq!(entries, vec!["temp1", "temp2"]);
}

#[tokio::test]
async fn unreachable_redis_fails_to_connect() {
    let config = CacheConfig {
        backend: CacheBackendKind::Redis,
        redis_url: Some("redis://127.0.0.1:1".to_string()),
        timeout: std::time::Duration::from_millis(200),
        ..CacheConfig::default()
    };
    assert!(RedisStore::connect(&config).await.is_err());
}
