use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use mqbridge::{
    api::{self, ApiState},
    auth::{AuthGate, UserConfig},
    broker::MemoryBroker,
    cache::{CacheError, CacheStore, MemoryStore},
    domain::{CacheRecord, MappingBlock, MappingEntry, QueueDefinition, WriteOperationSpec},
    ingest::{IngestOptions, IngestionSubsystem, ReconnectPolicy},
};
use serde_json::{Value, json};
use tower::ServiceExt;

const READER_TOKEN: &str = "reader-token";
const OPERATOR_TOKEN: &str = "operator-token";
const MASTER_TOKEN: &str = "master-token";

fn entry(to: &str, from: &str) -> MappingEntry {
    MappingEntry {
        to: to.to_string(),
        from: from.to_string(),
        description: format!("{to} reading"),
        post: false,
        role: None,
        handler_method: None,
    }
}

fn queues() -> Vec<QueueDefinition> {
    let mut active = entry("active", "active");
    active.post = true;
    active.handler_method = Some(WriteOperationSpec {
        name: "set_active_state".to_string(),
        args: BTreeMap::from([("active".to_string(), "bool".to_string())]),
    });

    vec![
        QueueDefinition::new("leds", "command")
            .with_binding("actuators", "")
            .with_mapping(MappingBlock {
                base: "/leds".to_string(),
                map: vec![active],
            }),
        QueueDefinition::new("sensors", "senml")
            .with_binding("telemetry", "")
            .with_mapping(MappingBlock {
                base: "/sensors".to_string(),
                map: vec![entry("temperature", "office/temp1")],
            }),
    ]
}

fn users() -> Vec<UserConfig> {
    vec![
        UserConfig {
            name: "dashboard".to_string(),
            token: READER_TOKEN.to_string(),
            roles: vec!["getter".to_string()],
        },
        UserConfig {
            name: "operator".to_string(),
            token: OPERATOR_TOKEN.to_string(),
            roles: vec!["getter".to_string(), "setter".to_string()],
        },
    ]
}

struct Harness {
    router: Router,
    broker: MemoryBroker,
    ingestion: Arc<IngestionSubsystem>,
}

fn harness(store: Arc<dyn CacheStore>) -> Harness {
    harness_with(queues(), store)
}

fn harness_with(queues: Vec<QueueDefinition>, store: Arc<dyn CacheStore>) -> Harness {
    let broker = MemoryBroker::new();
    let options = IngestOptions {
        strict_handlers: true,
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(5),
        },
    };
    let ingestion = Arc::new(IngestionSubsystem::new(
        queues.clone(),
        store,
        Arc::new(broker.clone()),
        options,
    ));
    ingestion.validate().expect("valid queues");
    let routes = api::build_routes(&queues, &ingestion).expect("routes should build");

    let auth = AuthGate::new(&users(), Some(MASTER_TOKEN));
    let router = api::build_router(ApiState::new(ingestion.clone(), Arc::new(auth)), &routes);
    Harness {
        router,
        broker,
        ingestion,
    }
}

fn memory_harness() -> Harness {
    let (store, _worker) = MemoryStore::spawn();
    harness(store)
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request should build");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn wait_for_bindings(broker: &MemoryBroker, exchange: &str) {
    for _ in 0..200 {
        if broker.bound_queues(exchange) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no consumer bound to {exchange}");
}

async fn wait_for_record(store: &dyn CacheStore, category: &str, entry: &str) -> CacheRecord {
    for _ in 0..200 {
        if let Some(record) = store.read(category, entry).await {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("record {category}/{entry} never appeared");
}

#[tokio::test]
async fn telemetry_flows_from_broker_to_mapped_route() {
    let harness = memory_harness();
    let consumers = harness.ingestion.start();
    wait_for_bindings(&harness.broker, "telemetry").await;

    let payload = json!([
        {"bn": "office/", "n": "temp1", "u": "Cel", "v": 21.5},
        {"n": "humidity", "u": "%RH", "v": 40}
    ]);
    assert_eq!(
        harness
            .broker
            .publish("telemetry", "", payload.to_string().into_bytes()),
        1
    );

    let store = harness.ingestion.store().clone();
    wait_for_record(store.as_ref(), "sensors", "office/temp1").await;

    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/sensors/temperature",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entry"]["v"], json!(21.5));
    assert!(body["meta"]["time"].is_string());

    for handle in consumers {
        handle.task.abort();
    }
}

#[tokio::test]
async fn discrete_command_is_readable_under_raw_base() {
    let queue = QueueDefinition::new("sensors", "command")
        .with_binding("telemetry", "")
        .with_mapping(MappingBlock {
            base: "/raw".to_string(),
            map: vec![entry("temp1", "temp1")],
        });
    let (store, _worker) = MemoryStore::spawn();
    let harness = harness_with(vec![queue], store);
    let consumers = harness.ingestion.start();
    wait_for_bindings(&harness.broker, "telemetry").await;

    harness
        .broker
        .publish("telemetry", "", br#"{"type": "temp1", "value": 23}"#.to_vec());
    let store = harness.ingestion.store().clone();
    wait_for_record(store.as_ref(), "sensors", "temp1").await;

    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/raw/temp1",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entry"], json!({"value": 23}));
    assert!(body["meta"]["time"].is_string());

    for handle in consumers {
        handle.task.abort();
    }
}

#[tokio::test]
async fn write_publishes_command_and_round_trips_through_consumer() {
    let harness = memory_harness();
    let consumers = harness.ingestion.start();
    wait_for_bindings(&harness.broker, "actuators").await;

    let (status, body) = send(
        &harness.router,
        Method::POST,
        "/leds/active",
        Some(OPERATOR_TOKEN),
        Some(json!({"active": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "actuators");
    let command: Value = serde_json::from_slice(&published[0].payload).expect("json command");
    assert_eq!(command, json!({"type": "active", "value": true}));

    let store = harness.ingestion.store().clone();
    let record = wait_for_record(store.as_ref(), "leds", "active").await;
    assert_eq!(record.entry, json!({"value": true}));

    for handle in consumers {
        handle.task.abort();
    }
}

#[tokio::test]
async fn missing_record_is_not_found() {
    let harness = memory_harness();
    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/sensors/temperature",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("not_found"));
}

#[tokio::test]
async fn getter_token_cannot_write() {
    let harness = memory_harness();
    let (status, _) = send(
        &harness.router,
        Method::POST,
        "/leds/active",
        Some(READER_TOKEN),
        Some(json!({"active": true})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(harness.broker.published().is_empty());
}

#[tokio::test]
async fn body_must_match_declared_arguments() {
    let harness = memory_harness();

    for body in [
        json!({"active": "yes"}),
        json!({}),
        json!({"active": true, "brightness": 3}),
        json!([true]),
    ] {
        let (status, _) = send(
            &harness.router,
            Method::POST,
            "/leds/active",
            Some(OPERATOR_TOKEN),
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body} should be rejected");
    }
    assert!(harness.broker.published().is_empty());
}

#[tokio::test]
async fn read_only_route_rejects_post() {
    let harness = memory_harness();
    let (status, _) = send(
        &harness.router,
        Method::POST,
        "/sensors/temperature",
        Some(MASTER_TOKEN),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn raw_endpoints_list_and_read_everything() {
    let harness = memory_harness();
    let store = harness.ingestion.store().clone();
    store.write("sensors", "temp1", json!({"v": 20})).await;
    store.write("leds", "active", json!({"value": false})).await;
    wait_for_record(store.as_ref(), "leds", "active").await;

    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/raw/_listcategories",
        Some(MASTER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["leds", "sensors"]));

    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/raw/_entries/sensors",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["temp1"]));

    let (status, body) = send(
        &harness.router,
        Method::GET,
        "/raw/_entry/leds/active",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entry"], json!({"value": false}));

    let (status, _) = send(
        &harness.router,
        Method::GET,
        "/raw/_entry/leds/missing",
        Some(READER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn route_listing_describes_generated_routes() {
    let mut restricted = entry("humidity", "office/hum1");
    restricted.role = Some("facilities".to_string());
    let mut queues = queues();
    if let Some(mapping) = queues[1].mapping.as_mut() {
        mapping.map.push(restricted);
    }
    let (store, _worker) = MemoryStore::spawn();
    let harness = harness_with(queues, store);

    let (status, _) = send(&harness.router, Method::GET, "/raw/_routes", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) =
        send(&harness.router, Method::GET, "/raw/_routes", Some(READER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    let paths: Vec<&str> = body
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|route| route["path"].as_str())
        .collect();
    assert_eq!(paths, vec!["/leds/active", "/sensors/temperature"]);
    assert_eq!(body[0]["description"], json!("active reading"));
    assert_eq!(body[0]["write"]["operation"], json!("set_active_state"));
    assert_eq!(body[0]["write"]["args"], json!({"active": "boolean"}));
    assert_eq!(body[1]["write"], Value::Null);

    let (status, body) =
        send(&harness.router, Method::GET, "/raw/_routes", Some(MASTER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(3));
    assert_eq!(body[2]["required_role"], json!("facilities"));
}

#[tokio::test]
async fn healthz_needs_no_token() {
    let harness = memory_harness();
    let (status, body) = send(&harness.router, Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["queues"], json!(2));
}

#[tokio::test]
async fn api_key_header_is_accepted() {
    let harness = memory_harness();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/raw/_listcategories")
        .header("x-api-key", READER_TOKEN)
        .body(Body::empty())
        .expect("request should build");
    let response = harness
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);
}

/// Store that only counts how often it is touched.
#[derive(Default)]
struct CountingStore {
    touched: AtomicUsize,
}

#[async_trait]
impl CacheStore for CountingStore {
    fn backend(&self) -> &'static str {
        "counting"
    }

    async fn write(&self, _category: &str, _entry: &str, _value: Value) {
        self.touched.fetch_add(1, Ordering::SeqCst);
    }

    async fn lookup(
        &self,
        _category: &str,
        _entry: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        self.touched.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn list_categories(&self) -> Result<BTreeSet<String>, CacheError> {
        self.touched.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeSet::new())
    }

    async fn list_entries(&self, _category: &str) -> Result<BTreeSet<String>, CacheError> {
        self.touched.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeSet::new())
    }
}

#[tokio::test]
async fn rejected_tokens_never_reach_the_store() {
    let store = Arc::new(CountingStore::default());
    let harness = harness(store.clone());

    for (uri, token) in [
        ("/sensors/temperature", None),
        ("/sensors/temperature", Some("wrong-token")),
        ("/raw/_listcategories", Some("")),
        ("/raw/_entry/leds/active", Some("wrong-token")),
    ] {
        let (status, body) = send(&harness.router, Method::GET, uri, token, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} with {token:?}");
        assert!(body["error"]["code"].is_string());
    }
    assert_eq!(store.touched.load(Ordering::SeqCst), 0);
}
