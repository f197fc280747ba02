//! HttpVaultClient against an in-process mock vault served by axum

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vaultflow_core::{
    Batch, BatchEngine, BulkDeleteController, BulkDeleteOptions, ClientConfig, Destination,
    DrainState, EngineOptions, ErrorKind, HttpVaultClient, Operation, OperationValue, PoolConfig,
    RecordOutcome, RetryConfig, VaultApi, VaultError,
};

const TOKEN: &str = "test-token";

#[derive(Default)]
struct MockVault {
    tables: Mutex<HashMap<String, Vec<String>>>,
    failures: Mutex<VecDeque<(StatusCode, Option<&'static str>)>>,
    latency: Mutex<Option<Duration>>,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockVault {
    fn with_table(self, table: &str, n: usize) -> Self {
        self.tables
            .lock()
            .insert(table.to_string(), (0..n).map(|i| format!("sid-{}", i)).collect());
        self
    }

    fn fail_next(&self, status: StatusCode, retry_after: Option<&'static str>) {
        self.failures.lock().push_back((status, retry_after));
    }

    /// Common request preamble: auth, latency, scripted failures
    async fn enter(&self, headers: &HeaderMap) -> Result<InFlight<'_>, Response> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(format!("Bearer {}", TOKEN).as_str());
        if !authorized {
            return Err(error_response(StatusCode::UNAUTHORIZED, None));
        }

        let failure = self.failures.lock().pop_front();
        if let Some((status, retry_after)) = failure {
            return Err(error_response(status, retry_after));
        }
        Ok(guard)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn error_response(status: StatusCode, retry_after: Option<&'static str>) -> Response {
    let body = Json(json!({"error": {"message": status.to_string()}}));
    match retry_after {
        Some(seconds) => (status, [(header::RETRY_AFTER, seconds)], body).into_response(),
        None => (status, body).into_response(),
    }
}

async fn post_records(
    State(vault): State<Arc<MockVault>>,
    Path((_vault_id, table)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let _guard = match vault.enter(&headers).await {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    if table == "detokenize" {
        let records: Vec<Value> = body["detokenizationParameters"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|p| {
                let token = p["token"].as_str().unwrap_or_default();
                match token.strip_prefix("tok-") {
                    Some(value) => json!({"token": token, "value": value}),
                    None => json!({"token": token, "error": {"message": "token not found"}}),
                }
            })
            .collect();
        return Json(json!({ "records": records })).into_response();
    }

    if table == "broken" {
        return Json(json!({"records": []})).into_response();
    }

    assert_eq!(body["tokenization"], json!(true));
    let column = body["upsert"].as_str().unwrap_or_default().to_string();
    let records: Vec<Value> = body["records"]
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, r)| {
            let value = r["fields"][&column].as_str().unwrap_or_default();
            if value == "invalid" {
                json!({"error": {"message": "invalid value"}})
            } else {
                let mut tokens = serde_json::Map::new();
                tokens.insert(column.clone(), json!(format!("tok-{}", value)));
                json!({"skyflow_id": format!("sid-{}", i), "tokens": tokens})
            }
        })
        .collect();
    Json(json!({ "records": records })).into_response()
}

#[derive(Deserialize)]
struct Page {
    offset: usize,
    limit: usize,
}

async fn get_records(
    State(vault): State<Arc<MockVault>>,
    Path((_vault_id, table)): Path<(String, String)>,
    Query(page): Query<Page>,
    headers: HeaderMap,
) -> Response {
    let _guard = match vault.enter(&headers).await {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    let tables = vault.tables.lock();
    let Some(ids) = tables.get(&table) else {
        return error_response(StatusCode::NOT_FOUND, None);
    };
    let records: Vec<Value> = ids
        .iter()
        .skip(page.offset)
        .take(page.limit)
        .map(|id| json!({"fields": {"skyflow_id": id}}))
        .collect();
    Json(json!({ "records": records })).into_response()
}

async fn delete_records(
    State(vault): State<Arc<MockVault>>,
    Path((_vault_id, table)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let _guard = match vault.enter(&headers).await {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    let ids: Vec<String> = body["skyflow_ids"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if let Some(stored) = vault.tables.lock().get_mut(&table) {
        stored.retain(|id| !ids.contains(id));
    }
    let records: Vec<Value> = ids
        .iter()
        .map(|id| json!({"skyflow_id": id, "deleted": true}))
        .collect();
    Json(json!({ "records": records })).into_response()
}

async fn serve(vault: Arc<MockVault>) -> String {
    let app = Router::new()
        .route(
            "/v1/vaults/:vault/:table",
            post(post_records).get(get_records).delete(delete_records),
        )
        .with_state(vault);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base_url: &str) -> HttpVaultClient {
    HttpVaultClient::new(ClientConfig::new(base_url, TOKEN).with_timeout(Duration::from_secs(5)))
        .unwrap()
}

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_retries(5)
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
}

fn dest(table: &str, column: &str) -> Destination {
    Destination::new("vault1", table, column)
}

#[tokio::test]
async fn test_tokenize_and_detokenize_through_engine() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client = Arc::new(client(&url));
    let engine = BatchEngine::new(
        client.clone(),
        EngineOptions::default()
            .with_batch_size(4)
            .with_pool(PoolConfig::new(3))
            .with_retry(fast_retry()),
    );
    let cancel = CancellationToken::new();
    let values: Vec<String> = (0..10).map(|i| format!("user{}@example.com", i)).collect();

    let tokens = engine
        .tokenize_values(values.clone(), &dest("persons", "email"), &cancel)
        .await
        .unwrap();
    assert!(tokens.is_complete_success());
    assert_eq!(tokens.stats.batches, 3);

    let detokenized = engine
        .detokenize_tokens(
            tokens.results.iter().map(|r| r.value().unwrap().to_string()),
            &dest("persons", "email"),
            &cancel,
        )
        .await
        .unwrap();
    let plain: Vec<_> = detokenized
        .results
        .iter()
        .map(|r| r.value().unwrap().to_string())
        .collect();
    assert_eq!(plain, values);

    let stats = client.buffer_stats();
    assert_eq!(stats.outstanding(), 0);
    assert!(stats.reuse_rate() > 0.0);
}

#[tokio::test]
async fn test_per_record_error_does_not_fail_batch() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client = client(&url);
    let d = dest("persons", "ssn");
    let batch = Batch::new(vec![
        Operation::tokenize(0, "123", d.clone()),
        Operation::tokenize(1, "invalid", d.clone()),
        Operation::tokenize(2, "456", d),
    ])
    .unwrap();

    let outcomes = client.execute(&batch).await.unwrap();
    assert_eq!(outcomes[0], RecordOutcome::value("tok-123"));
    assert_eq!(outcomes[1], RecordOutcome::rejected("invalid value"));
    assert_eq!(outcomes[2], RecordOutcome::value("tok-456"));
}

#[tokio::test]
async fn test_status_classification() {
    let vault = Arc::new(MockVault::default());
    let url = serve(vault.clone()).await;
    let client = client(&url);
    let batch = Batch::new(vec![Operation::tokenize(0, "x", dest("persons", "email"))]).unwrap();

    vault.fail_next(StatusCode::TOO_MANY_REQUESTS, Some("7"));
    match client.execute(&batch).await {
        Err(VaultError::RateLimited { retry_after, .. }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)))
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    vault.fail_next(StatusCode::SERVICE_UNAVAILABLE, None);
    let err = client.execute(&batch).await.unwrap_err();
    assert!(matches!(err, VaultError::Server { status: 503, .. }));
    assert!(err.is_retryable());

    vault.fail_next(StatusCode::REQUEST_TIMEOUT, None);
    assert_eq!(client.execute(&batch).await.unwrap_err().kind(), ErrorKind::RequestTimeout);

    vault.fail_next(StatusCode::BAD_REQUEST, None);
    let err = client.execute(&batch).await.unwrap_err();
    assert!(matches!(err, VaultError::Client { status: 400, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_bad_token_is_auth_failure() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client =
        HttpVaultClient::new(ClientConfig::new(url.as_str(), "wrong-token")).unwrap();
    let batch = Batch::new(vec![Operation::tokenize(0, "x", dest("persons", "email"))]).unwrap();

    let err = client.execute(&batch).await.unwrap_err();
    assert!(err.is_auth_failure());
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_record_count_mismatch_is_malformed() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client = client(&url);
    let batch = Batch::new(vec![Operation::tokenize(0, "x", dest("broken", "email"))]).unwrap();
    let err = client.execute(&batch).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_engine_retries_rate_limit_then_succeeds() {
    let vault = Arc::new(MockVault::default());
    let url = serve(vault.clone()).await;
    vault.fail_next(StatusCode::TOO_MANY_REQUESTS, Some("1"));
    vault.fail_next(StatusCode::INTERNAL_SERVER_ERROR, None);

    let engine = BatchEngine::new(
        Arc::new(client(&url)),
        EngineOptions::default()
            .with_pool(PoolConfig::new(1))
            .with_retry(fast_retry()),
    );
    let report = engine
        .tokenize_values(["a", "b"], &dest("persons", "email"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete_success());
    assert_eq!(report.stats.attempts, 3);
    assert_eq!(report.stats.rate_limited, 1);
    assert_eq!(report.stats.retried_succeeded, 2);
    assert!(report.elapsed >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_fetch_missing_table_is_empty() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client = client(&url);
    let batch =
        Batch::new(vec![Operation::fetch_ids(0, 0, 100, dest("nope", "skyflow_id"))]).unwrap();
    let outcomes = client.execute(&batch).await.unwrap();
    assert_eq!(
        outcomes,
        vec![RecordOutcome::Value(OperationValue::Identifiers(Vec::new()))]
    );
}

#[tokio::test]
async fn test_bulk_delete_drains_table() {
    let vault = Arc::new(MockVault::default().with_table("persons", 137));
    let url = serve(vault.clone()).await;
    let controller = BulkDeleteController::new(
        Arc::new(client(&url)),
        BulkDeleteOptions::new("vault1")
            .with_fetch(25, 3)
            .with_delete(10, 4)
            .with_retry(fast_retry()),
    );

    let report = controller
        .drain("persons", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.state, DrainState::ExhaustedSuccess);
    assert_eq!(report.deleted, 137);
    assert!(vault.tables.lock()["persons"].is_empty());
}

#[tokio::test]
async fn test_bulk_delete_missing_table_over_http() {
    let vault = Arc::new(MockVault::default());
    let url = serve(vault.clone()).await;
    let controller = BulkDeleteController::new(
        Arc::new(client(&url)),
        BulkDeleteOptions::new("vault1")
            .with_fetch(50, 2)
            .with_retry(fast_retry()),
    );

    let report = controller
        .drain("archived", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.state, DrainState::ExhaustedSuccess);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.fetch_failures, 0);
    assert_eq!(report.iterations, 1);
    // one GET per fetch worker, each answered with 404, and no deletes
    assert_eq!(vault.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_request_buffers_are_reused_across_requests() {
    let url = serve(Arc::new(MockVault::default())).await;
    let client = client(&url);
    let d = dest("persons", "email");

    for i in 0..20 {
        let batch = Batch::new(vec![
            Operation::tokenize(0, format!("user{}@example.com", i), d.clone()),
            Operation::tokenize(1, format!("other{}@example.com", i), d.clone()),
        ])
        .unwrap();
        client.execute(&batch).await.unwrap();
    }

    let stats = client.buffer_stats();
    assert_eq!(stats.acquired.load(Ordering::Relaxed), 20);
    assert_eq!(stats.outstanding(), 0);
    assert!(
        stats.allocated.load(Ordering::Relaxed) <= 2,
        "sequential requests should reuse one buffer, allocated {}",
        stats.allocated.load(Ordering::Relaxed)
    );
    assert!(stats.reused.load(Ordering::Relaxed) >= 18);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_cap_limits_concurrent_requests() {
    let vault = Arc::new(MockVault::default());
    *vault.latency.lock() = Some(Duration::from_millis(50));
    let url = serve(vault.clone()).await;

    let client = HttpVaultClient::new(ClientConfig::new(url.as_str(), TOKEN).with_max_connections(2))
        .unwrap();
    let engine = BatchEngine::new(
        Arc::new(client),
        EngineOptions::default()
            .with_batch_size(1)
            .with_pool(PoolConfig::new(8))
            .with_retry(fast_retry()),
    );
    let report = engine
        .tokenize_values(
            (0..16).map(|i| i.to_string()),
            &dest("persons", "email"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.is_complete_success());
    assert_eq!(vault.requests.load(Ordering::SeqCst), 16);
    assert!(vault.peak_in_flight.load(Ordering::SeqCst) <= 2);
}
