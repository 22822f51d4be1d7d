use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use cv_bridge::http_transport::HttpLogTransport;
use cv_bridge::transport::{GroupTransport, TransportError};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct MockLog {
    records: Arc<Mutex<Vec<(String, Option<String>, String)>>>,
    auth: Arc<Mutex<Vec<String>>>,
    fail_reads: Arc<Mutex<bool>>,
}

async fn produce(
    State(log): State<MockLog>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if let Some(auth) = headers.get("authorization") {
        log.auth
            .lock()
            .unwrap()
            .push(auth.to_str().unwrap().to_string());
    }
    let mut records = log.records.lock().unwrap();
    for rec in body["records"].as_array().unwrap() {
        records.push((
            topic.clone(),
            rec["key"].as_str().map(str::to_string),
            rec["value"].as_str().unwrap().to_string(),
        ));
    }
    StatusCode::NO_CONTENT
}

async fn fetch(
    State(log): State<MockLog>,
    Path(topic): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if *log.fail_reads.lock().unwrap() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(q.get("group").map(String::as_str), Some("g1"));
    let after: Option<usize> = q.get("after").and_then(|a| a.parse().ok());
    let records: Vec<Value> = log
        .records
        .lock()
        .unwrap()
        .iter()
        .enumerate()
        .filter(|(i, (t, _, _))| t == &topic && after.map_or(true, |a| *i > a))
        .map(|(i, (_, k, v))| json!({ "offset": i, "key": k, "value": v }))
        .collect();
    Ok(Json(json!({ "records": records })))
}

async fn start_mock() -> (String, MockLog) {
    let log = MockLog::default();
    let app = Router::new()
        .route("/topics/{topic}/records", get(fetch).post(produce))
        .with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), log)
}

fn transport(base: &str) -> HttpLogTransport {
    HttpLogTransport::new(
        base,
        "g1",
        Duration::from_millis(20),
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn publish_posts_record_with_bearer_key() {
    let (base, log) = start_mock().await;
    let t = transport(&base).with_api_key(Some("secret".into()));

    t.publish("group.ops.requests", Some("a1"), br#"{"x":1}"#.to_vec())
        .await
        .unwrap();

    let records = log.records.lock().unwrap().clone();
    assert_eq!(
        records,
        vec![(
            "group.ops.requests".to_string(),
            Some("a1".to_string()),
            r#"{"x":1}"#.to_string()
        )]
    );
    assert_eq!(log.auth.lock().unwrap().as_slice(), ["Bearer secret"]);
}

#[tokio::test]
async fn subscription_polls_each_record_once() {
    let (base, _log) = start_mock().await;
    let t = transport(&base);
    let topic = "group.ops.announce".to_string();

    let sub = t.subscribe(&[topic.clone()]).await.unwrap();
    t.publish(&topic, None, b"one".to_vec()).await.unwrap();
    t.publish(&topic, None, b"two".to_vec()).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.value, b"one");
    assert_eq!(second.value, b"two");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sub.pending(), 0);
}

#[tokio::test]
async fn read_failure_ends_subscription_with_error() {
    let (base, log) = start_mock().await;
    *log.fail_reads.lock().unwrap() = true;
    let t = transport(&base);

    let sub = t.subscribe(&["group.ops.traces".to_string()]).await.unwrap();
    let item = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(item, Err(TransportError::ReceiveFailed(_))));
    let end = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn publish_to_unreachable_proxy_fails() {
    let t = transport("http://127.0.0.1:9");
    let err = t.publish("t", None, b"x".to_vec()).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::NotConnected | TransportError::SendFailed(_) | TransportError::Timeout(_)
    ));
}
