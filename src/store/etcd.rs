//! etcd v3 client over the JSON gateway
//!
//! Talks to the `/v3/*` HTTP endpoints every etcd member serves next to
//! gRPC. Keys and values travel base64-encoded; int64 fields come back as
//! JSON strings.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::{CoordinationStore, KeyValue, LeaseId};
use crate::error::{Error, Result};

/// etcd client with sticky failover across endpoints
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
    /// Index of the last endpoint that answered
    current: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Deserialize)]
struct KeepAliveEnvelope {
    #[serde(default)]
    result: Option<KeepAliveResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    lease: i64,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
    sort_order: &'static str,
    sort_target: &'static str,
}

impl PutRequest {
    fn new(key: &str, value: &[u8], lease: LeaseId) -> Self {
        Self {
            key: BASE64.encode(key),
            value: BASE64.encode(value),
            lease,
        }
    }
}

impl RangeRequest {
    /// Every key under `prefix`, highest key first
    fn prefix(prefix: &str) -> Self {
        Self {
            key: BASE64.encode(prefix),
            range_end: BASE64.encode(prefix_end(prefix.as_bytes())),
            sort_order: "DESCEND",
            sort_target: "KEY",
        }
    }
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Accept an int64 encoded either as a JSON number or a JSON string
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Smallest key strictly greater than every key starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Whole keyspace
    vec![0]
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

impl EtcdStore {
    /// Connect to the first reachable endpoint
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("no etcd endpoints given".into()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Store(format!("failed to build HTTP client: {}", e)))?;

        let store = Self {
            client,
            endpoints: endpoints.iter().map(|e| normalize_endpoint(e)).collect(),
            current: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };

        let _: serde_json::Value = store
            .post("/v3/maintenance/status", &serde_json::json!({}))
            .await?;
        tracing::info!("Connected to etcd via {}", store.current_endpoint());

        Ok(store)
    }

    /// Endpoint currently used for requests
    pub fn current_endpoint(&self) -> &str {
        &self.endpoints[self.current.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreClosed);
        }

        let count = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let url = format!("{}{}", self.endpoints[idx], path);

            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    if idx != start % count {
                        tracing::warn!("etcd failover: now using {}", self.endpoints[idx]);
                        self.current.store(idx, Ordering::Relaxed);
                    }
                    return Self::decode(response).await;
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!("etcd endpoint {} unreachable: {}", self.endpoints[idx], e);
                    last_err = Some(Error::from(e));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::StoreUnavailable("no etcd endpoint reachable".into())))
    }

    async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GatewayError>(&text)
                .ok()
                .and_then(|e| e.message.or(e.error))
                .unwrap_or(text);
            let message = format!("{}: {}", status, message);
            return Err(if status.is_server_error() {
                Error::StoreUnavailable(message)
            } else {
                Error::Store(message)
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| Error::Store(format!("invalid gateway response: {}", e)))
    }
}

#[async_trait::async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let request = LeaseGrantRequest {
            ttl: ttl.as_secs().max(1) as i64,
            id: 0,
        };
        let response: LeaseGrantResponse = self.post("/v3/lease/grant", &request).await?;

        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            return Err(Error::Store(format!("lease grant rejected: {}", error)));
        }
        if response.id == 0 {
            return Err(Error::Store("lease grant returned no lease id".into()));
        }
        Ok(response.id)
    }

    async fn put_with_lease(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<()> {
        let request = PutRequest::new(key, value, lease);
        let _: serde_json::Value = self.post("/v3/kv/put", &request).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let request = RangeRequest::prefix(prefix);
        let response: RangeResponse = self.post("/v3/kv/range", &request).await?;

        response
            .kvs
            .into_iter()
            .map(|raw| -> Result<KeyValue> {
                let key = BASE64
                    .decode(&raw.key)
                    .map_err(|e| Error::Store(format!("invalid key encoding: {}", e)))?;
                let value = BASE64
                    .decode(&raw.value)
                    .map_err(|e| Error::Store(format!("invalid value encoding: {}", e)))?;
                Ok(KeyValue::new(String::from_utf8_lossy(&key).into_owned(), value))
            })
            .collect()
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let envelope: KeepAliveEnvelope = self
            .post("/v3/lease/keepalive", &LeaseIdRequest { id: lease })
            .await?;

        if let Some(error) = envelope.error {
            return Err(Error::Store(format!("keepalive failed: {}", error)));
        }

        Ok(envelope
            .result
            .filter(|r| r.ttl > 0)
            .map(|r| Duration::from_secs(r.ttl as u64)))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let _: serde_json::Value = self
            .post("/v3/lease/revoke", &LeaseIdRequest { id: lease })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("etcd session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal gateway answering every request with a lease-shaped body,
    /// recording the request paths it served
    fn serve_gateway(listener: TcpListener) -> Arc<Mutex<Vec<String>>> {
        let served = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&served);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let (head_len, body_len) = loop {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                            let body_len = head
                                .lines()
                                .filter_map(|line| line.split_once(':'))
                                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            break (pos + 4, body_len);
                        }
                    };
                    while buf.len() < head_len + body_len {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                    log.lock().unwrap().push(path);

                    let body = r#"{"header":{},"ID":"42","TTL":"5"}"#;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });

        served
    }

    #[test]
    fn test_lease_grant_wire_format() {
        let body = serde_json::to_value(LeaseGrantRequest { ttl: 5, id: 0 }).unwrap();
        assert_eq!(body, json!({"TTL": 5, "ID": 0}));

        let body = serde_json::to_value(LeaseIdRequest { id: 12 }).unwrap();
        assert_eq!(body, json!({"ID": 12}));
    }

    #[test]
    fn test_put_wire_format() {
        let body = serde_json::to_value(PutRequest::new("node:aa", b".", 7)).unwrap();
        assert_eq!(body, json!({"key": "bm9kZTphYQ==", "value": "Lg==", "lease": 7}));
    }

    #[test]
    fn test_range_wire_format() {
        let body = serde_json::to_value(RangeRequest::prefix("node:")).unwrap();
        assert_eq!(
            body,
            json!({
                "key": "bm9kZTo=",
                "range_end": "bm9kZTs=",
                "sort_order": "DESCEND",
                "sort_target": "KEY",
            })
        );
    }

    #[tokio::test]
    async fn test_failover_sticks_to_answering_endpoint() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_endpoint = format!("http://{}", live.local_addr().unwrap());
        let live_served = serve_gateway(live);

        // Reserve a port, then free it so connections to it are refused
        let refused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let refused_addr = refused.local_addr().unwrap();
        drop(refused);

        let endpoints = vec![format!("http://{}", refused_addr), live_endpoint.clone()];
        let store = EtcdStore::connect(&endpoints, Duration::from_secs(1), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(store.current_endpoint(), live_endpoint);

        // The first endpoint comes back; requests must stay on the one that answered
        let revived = TcpListener::bind(refused_addr).await.unwrap();
        let revived_served = serve_gateway(revived);

        assert_eq!(store.grant_lease(Duration::from_secs(5)).await.unwrap(), 42);
        assert_eq!(store.current_endpoint(), live_endpoint);
        assert_eq!(
            *live_served.lock().unwrap(),
            vec!["/v3/maintenance/status", "/v3/lease/grant"]
        );
        assert!(revived_served.lock().unwrap().is_empty());
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"node:"), b"node;".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b"\xff\xff"), vec![0]);
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("127.0.0.1:2379"), "http://127.0.0.1:2379");
        assert_eq!(normalize_endpoint("https://etcd:2379/"), "https://etcd:2379");
    }

    #[test]
    fn test_gateway_int64_as_string() {
        let response: LeaseGrantResponse =
            serde_json::from_str(r#"{"header":{"revision":"7"},"ID":"7587862072907410698","TTL":"5"}"#)
                .unwrap();
        assert_eq!(response.id, 7587862072907410698);

        let envelope: KeepAliveEnvelope =
            serde_json::from_str(r#"{"result":{"ID":"12","TTL":"5"}}"#).unwrap();
        assert_eq!(envelope.result.unwrap().ttl, 5);
    }

    #[test]
    fn test_expired_keepalive_has_no_ttl() {
        let envelope: KeepAliveEnvelope =
            serde_json::from_str(r#"{"result":{"header":{},"ID":"12"}}"#).unwrap();
        assert_eq!(envelope.result.unwrap().ttl, 0);
    }

    #[test]
    fn test_range_response_without_kvs() {
        let response: RangeResponse = serde_json::from_str(r#"{"header":{}}"#).unwrap();
        assert!(response.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let result = EtcdStore::connect(&[], Duration::from_secs(1), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_endpoint_fails() {
        // Port 1 on loopback is never an etcd member
        let endpoints = vec!["http://127.0.0.1:1".to_string()];
        let result =
            EtcdStore::connect(&endpoints, Duration::from_millis(200), Duration::from_millis(500)).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }
}
