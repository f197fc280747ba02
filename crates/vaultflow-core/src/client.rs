//! Vault HTTP client
//!
//! [`VaultApi`] is the seam between the engine and the remote vault: one
//! call per batch, one [`RecordOutcome`] per operation, by position.
//! [`HttpVaultClient`] is the production implementation.
//!
//! # Request lifecycle
//!
//! 1. Acquire a connection permit (bounded by `max_connections`)
//! 2. Check out a pooled buffer and serialize the request envelope into it
//! 3. Send with bearer auth and the configured timeout
//! 4. On 2xx map response records back onto the batch; per-record errors
//!    become [`RecordOutcome::Rejected`]
//! 5. Anything else becomes one batch-level [`VaultError`]
//!
//! Permit and buffer are RAII guards, so both are released on every path.
//! The serialized body is lent to `reqwest` without copying and reclaimed
//! once the response has been read.
//!
//! # Wire format
//!
//! | Operation  | Request                                                   |
//! |------------|-----------------------------------------------------------|
//! | tokenize   | `POST /v1/vaults/{vault}/{table}` insert with upsert       |
//! | detokenize | `POST /v1/vaults/{vault}/detokenize`                      |
//! | fetch ids  | `GET /v1/vaults/{vault}/{table}?offset=&limit=`            |
//! | delete     | `DELETE /v1/vaults/{vault}/{table}` with `skyflow_ids`     |

use crate::batch::Batch;
use crate::buffer_pool::{BufferPool, BufferPoolConfig, PoolStats};
use crate::config::AppConfig;
use crate::error::{Result, VaultError};
use crate::retry::parse_retry_after;
use crate::types::{OperationKind, OperationValue, Payload, RecordOutcome, SensitiveString};
use async_trait::async_trait;
use bytes::BufMut;
use reqwest::{header, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Longest error body carried into a [`VaultError`] message
const MAX_ERROR_BODY: usize = 512;

/// Remote vault operations, one call per batch
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Execute one batch and return exactly one outcome per operation, in
    /// batch order.
    ///
    /// Page fetches return a single [`OperationValue::Identifiers`] outcome;
    /// a missing table yields an empty list.
    async fn execute(&self, batch: &Batch) -> Result<Vec<RecordOutcome>>;
}

#[async_trait]
impl<T: VaultApi + ?Sized> VaultApi for Arc<T> {
    async fn execute(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        (**self).execute(batch).await
    }
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Vault base URL, without the `/v1` suffix
    pub base_url: String,
    pub bearer_token: SensitiveString,
    pub request_timeout: Duration,
    /// Concurrent request/response cycles across all callers
    pub max_connections: usize,
    /// Idle keep-alive connections kept per host
    pub max_idle_connections: usize,
    pub buffers: BufferPoolConfig,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<SensitiveString>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            request_timeout: Duration::from_secs(30),
            max_connections: 64,
            max_idle_connections: 32,
            buffers: BufferPoolConfig::default(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.vault.url.clone(),
            bearer_token: config.vault.bearer_token.clone(),
            request_timeout: config.engine.request_timeout(),
            max_connections: config.engine.max_connections,
            max_idle_connections: config.engine.max_idle_connections,
            buffers: config.engine.buffer_pool_config(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_sent: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_failed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Production [`VaultApi`] over `reqwest`
pub struct HttpVaultClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: SensitiveString,
    connections: Arc<Semaphore>,
    buffers: Arc<BufferPool>,
    stats: Arc<ClientStats>,
}

impl std::fmt::Debug for HttpVaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVaultClient")
            .field("base_url", &self.base_url)
            .field("available_connections", &self.connections.available_permits())
            .finish()
    }
}

impl HttpVaultClient {
    /// Build a client with a shared, size-limited connection pool
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| VaultError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            buffers: BufferPool::new(config.buffers),
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Self::new(ClientConfig::from_app_config(config))
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn buffer_stats(&self) -> &PoolStats {
        self.buffers.stats()
    }

    fn table_url(&self, vault_id: &str, table: &str) -> String {
        format!("{}/v1/vaults/{}/{}", self.base_url, vault_id, table)
    }

    fn detokenize_url(&self, vault_id: &str) -> String {
        format!("{}/v1/vaults/{}/detokenize", self.base_url, vault_id)
    }

    /// One request/response cycle. Returns the raw 2xx body.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<bytes::Bytes> {
        let _permit = self
            .connections
            .acquire()
            .await
            .map_err(|_| VaultError::network("connection pool closed"))?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.bearer_token.expose_secret()),
            )
            .header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        // Held until the response is read so the allocation can go back to the pool
        let _body_buffer = match body {
            Some(body) => {
                let mut buf = self.buffers.acquire();
                serde_json::to_writer((&mut *buf).writer(), body)?;
                let frozen = buf.freeze();
                self.stats
                    .bytes_sent
                    .fetch_add(frozen.len() as u64, Ordering::Relaxed);
                request = request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(frozen.bytes());
                Some(frozen)
            }
            None => None,
        };

        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        trace!("{} {}", method, url);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            self.stats.requests_success.fetch_add(1, Ordering::Relaxed);
            return Ok(response.bytes().await?);
        }

        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        let body = response.text().await.unwrap_or_default();
        debug!("{} {} returned {}", method, url, status);
        Err(VaultError::from_status(
            status.as_u16(),
            retry_after,
            truncate(&body, MAX_ERROR_BODY),
        ))
    }

    async fn tokenize(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        let dest = batch.destination();
        let envelope = InsertRequest {
            records: batch
                .iter()
                .map(|op| InsertRecord {
                    fields: BTreeMap::from([(dest.column.as_str(), payload_str(&op.payload))]),
                })
                .collect(),
            tokenization: true,
            upsert: &dest.column,
        };
        let url = self.table_url(&dest.vault_id, &dest.table);
        let body = self.send(Method::POST, &url, &[], Some(&envelope)).await?;
        parse_tokenize_response(&body, &dest.column, batch.len())
    }

    async fn detokenize(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        let envelope = DetokenizeRequest {
            detokenization_parameters: batch
                .iter()
                .map(|op| DetokenizeParam {
                    token: payload_str(&op.payload),
                    redaction: "PLAIN_TEXT",
                })
                .collect(),
        };
        let url = self.detokenize_url(&batch.destination().vault_id);
        let body = self.send(Method::POST, &url, &[], Some(&envelope)).await?;
        parse_detokenize_response(&body, batch.len())
    }

    async fn fetch_ids(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        let dest = batch.destination();
        let (offset, limit) = match batch.operations() {
            [op] => match op.payload {
                Payload::Page { offset, limit } => (offset, limit),
                _ => return Err(VaultError::config("fetch batch without a page payload")),
            },
            _ => return Err(VaultError::config("fetch batches must hold exactly one page")),
        };

        let url = self.table_url(&dest.vault_id, &dest.table);
        let query = [("offset", offset.to_string()), ("limit", limit.to_string())];
        match self.send::<()>(Method::GET, &url, &query, None).await {
            Ok(body) => {
                let ids = parse_fetch_response(&body, &dest.column)?;
                Ok(vec![RecordOutcome::Value(OperationValue::Identifiers(ids))])
            }
            Err(VaultError::Client { status: 404, .. }) => {
                debug!("Table {} not found, treating as empty", dest.table);
                Ok(vec![RecordOutcome::Value(OperationValue::Identifiers(Vec::new()))])
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        let dest = batch.destination();
        let envelope = DeleteRequest {
            skyflow_ids: batch.iter().map(|op| payload_str(&op.payload)).collect(),
        };
        let url = self.table_url(&dest.vault_id, &dest.table);
        self.send(Method::DELETE, &url, &[], Some(&envelope)).await?;
        Ok(batch
            .iter()
            .map(|op| RecordOutcome::value(payload_str(&op.payload)))
            .collect())
    }
}

#[async_trait]
impl VaultApi for HttpVaultClient {
    async fn execute(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        match batch.kind() {
            OperationKind::Tokenize => self.tokenize(batch).await,
            OperationKind::Detokenize => self.detokenize(batch).await,
            OperationKind::FetchIds => self.fetch_ids(batch).await,
            OperationKind::Delete => self.delete(batch).await,
        }
    }
}

fn payload_str(payload: &Payload) -> &str {
    payload.as_str().unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[derive(Serialize)]
struct InsertRequest<'a> {
    records: Vec<InsertRecord<'a>>,
    tokenization: bool,
    upsert: &'a str,
}

#[derive(Serialize)]
struct InsertRecord<'a> {
    fields: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetokenizeRequest<'a> {
    detokenization_parameters: Vec<DetokenizeParam<'a>>,
}

#[derive(Serialize)]
struct DetokenizeParam<'a> {
    token: &'a str,
    redaction: &'static str,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    skyflow_ids: Vec<&'a str>,
}

#[derive(Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    records: Vec<ResponseRecord>,
}

#[derive(Deserialize, Default)]
struct ResponseRecord {
    #[serde(default)]
    tokens: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    fields: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default, rename = "valueStr")]
    value_str: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl ResponseRecord {
    /// Per-record error message, if the API rejected this record
    fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        Some(match error {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("message")
                .map(json_to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        })
    }
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_records(body: &[u8], expected: usize) -> Result<Vec<ResponseRecord>> {
    let response: RecordsResponse = serde_json::from_slice(body)?;
    if response.records.len() != expected {
        return Err(VaultError::malformed(format!(
            "expected {} records, got {}",
            expected,
            response.records.len()
        )));
    }
    Ok(response.records)
}

fn parse_tokenize_response(body: &[u8], column: &str, expected: usize) -> Result<Vec<RecordOutcome>> {
    let records = parse_records(body, expected)?;
    Ok(records
        .into_iter()
        .map(|record| {
            if let Some(message) = record.error_message() {
                return RecordOutcome::Rejected(message);
            }
            match record.tokens.as_ref().and_then(|t| t.get(column)) {
                Some(token) => RecordOutcome::value(json_to_string(token)),
                None => RecordOutcome::rejected(format!("no token returned for column {}", column)),
            }
        })
        .collect())
}

fn parse_detokenize_response(body: &[u8], expected: usize) -> Result<Vec<RecordOutcome>> {
    let records = parse_records(body, expected)?;
    Ok(records
        .into_iter()
        .map(|record| {
            if let Some(message) = record.error_message() {
                return RecordOutcome::Rejected(message);
            }
            match (&record.value, &record.value_str) {
                (Some(value), _) => RecordOutcome::value(json_to_string(value)),
                (None, Some(value)) => RecordOutcome::value(value.clone()),
                (None, None) => RecordOutcome::rejected("no value returned for token"),
            }
        })
        .collect())
}

fn parse_fetch_response(body: &[u8], id_column: &str) -> Result<Vec<String>> {
    let response: RecordsResponse = serde_json::from_slice(body)?;
    response
        .records
        .iter()
        .map(|record| {
            record
                .fields
                .as_ref()
                .and_then(|f| f.get(id_column))
                .map(json_to_string)
                .ok_or_else(|| {
                    VaultError::malformed(format!("fetched record without {} field", id_column))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_insert_envelope_shape() {
        let envelope = InsertRequest {
            records: vec![
                InsertRecord {
                    fields: BTreeMap::from([("email", "a@example.com")]),
                },
                InsertRecord {
                    fields: BTreeMap::from([("email", "b@example.com")]),
                },
            ],
            tokenization: true,
            upsert: "email",
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "records": [
                    {"fields": {"email": "a@example.com"}},
                    {"fields": {"email": "b@example.com"}}
                ],
                "tokenization": true,
                "upsert": "email"
            })
        );
    }

    #[test]
    fn test_detokenize_envelope_shape() {
        let envelope = DetokenizeRequest {
            detokenization_parameters: vec![DetokenizeParam {
                token: "tok-1",
                redaction: "PLAIN_TEXT",
            }],
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "detokenizationParameters": [{"token": "tok-1", "redaction": "PLAIN_TEXT"}]
            })
        );
    }

    #[test]
    fn test_tokenize_response_continue_on_error() {
        let body = br#"{"records":[
            {"skyflow_id":"1","tokens":{"email":"tok-a"}},
            {"error":{"message":"invalid email"}},
            {"skyflow_id":"3","tokens":{"email":"tok-c"}}
        ]}"#;
        let outcomes = parse_tokenize_response(body, "email", 3).unwrap();
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::value("tok-a"),
                RecordOutcome::rejected("invalid email"),
                RecordOutcome::value("tok-c"),
            ]
        );
    }

    #[test]
    fn test_record_count_mismatch_is_malformed() {
        let body = br#"{"records":[{"tokens":{"email":"tok-a"}}]}"#;
        let err = parse_tokenize_response(body, "email", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = parse_detokenize_response(b"<html>", 1).unwrap_err();
        assert!(matches!(err, VaultError::MalformedResponse(_)));
    }

    #[test]
    fn test_detokenize_response_values() {
        let body = br#"{"records":[
            {"token":"t1","value":"alice"},
            {"token":"t2","valueStr":"bob"},
            {"token":"t3","value":42},
            {"token":"t4","error":"token not found"}
        ]}"#;
        let outcomes = parse_detokenize_response(body, 4).unwrap();
        assert_eq!(outcomes[0], RecordOutcome::value("alice"));
        assert_eq!(outcomes[1], RecordOutcome::value("bob"));
        assert_eq!(outcomes[2], RecordOutcome::value("42"));
        assert_eq!(outcomes[3], RecordOutcome::rejected("token not found"));
    }

    #[test]
    fn test_fetch_response_ids() {
        let body = br#"{"records":[
            {"fields":{"skyflow_id":"id-1","name":"x"}},
            {"fields":{"skyflow_id":"id-2"}}
        ]}"#;
        assert_eq!(parse_fetch_response(body, "skyflow_id").unwrap(), vec!["id-1", "id-2"]);
        assert!(parse_fetch_response(br#"{}"#, "skyflow_id").unwrap().is_empty());
        assert!(parse_fetch_response(br#"{"records":[{"fields":{}}]}"#, "skyflow_id").is_err());
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h...");
    }
}
