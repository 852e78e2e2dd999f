//! Low-level HTTP client for one backend node.
//!
//! Speaks the backend's native HTTP+JSON protocol and nothing more: model
//! listing (`/api/tags`), running models (`/api/ps`), and unary or streaming
//! generation (`/api/generate`, newline-delimited JSON chunks). The client
//! never touches the registry or reliability state; it reports what happened
//! through [`ClientError`] and leaves policy to the router.
//!
//! Three `reqwest` clients back the operations: a probe client with a short
//! overall timeout, a unary client whose per-request timeout carries the
//! attempt deadline, and a streaming client with no overall timeout at all —
//! a single inference on a large CPU-bound model routinely runs for many
//! minutes, so only the connect phase and the idle gap between chunks are
//! bounded.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{catalog::OomMatcher, config::RequestConfig, registry::Node};

/// What went wrong talking to one node, from the router's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("backend returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("attempt timed out")]
    Timeout,

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("canceled")]
    Canceled,

    #[error("backend out of memory: {0}")]
    OomSuspected(String),
}

impl ClientError {
    /// Map a transport-level reqwest failure onto the error taxonomy.
    fn transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// One entry from the tags listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// One entry from the running-models listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub size_vram: u64,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunningResponse {
    #[serde(default)]
    models: Vec<RunningModel>,
}

/// One decoded chunk of a generate stream.
///
/// Unknown fields are retained so the chunk can be re-serialized verbatim for
/// proxying; `done` is required — a JSON line without it is malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    pub done: bool,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Lazy, finite, non-restartable stream of generate chunks.
///
/// Chunks arrive in backend order. Any I/O error, idle timeout, or
/// cancellation puts the stream into a failing state: the next pull yields
/// the error and the stream then ends. Dropping the stream cancels the relay
/// task, which closes the underlying connection.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<GenerateChunk, ClientError>>,
    _relay: DropGuard,
}

impl Stream for ChunkStream {
    type Item = Result<GenerateChunk, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
impl ChunkStream {
    /// Build a stream fed by a bare channel, for tests that need to script
    /// chunk sequences without a backend.
    pub(crate) fn scripted(rx: mpsc::Receiver<Result<GenerateChunk, ClientError>>) -> Self {
        Self {
            rx,
            _relay: CancellationToken::new().drop_guard(),
        }
    }
}

/// HTTP client shared by all nodes in the fleet.
pub struct NodeClient {
    probe: reqwest::Client,
    unary: reqwest::Client,
    stream: reqwest::Client,
    oom: Arc<OomMatcher>,
}

impl NodeClient {
    pub fn new(cfg: &RequestConfig, oom: Arc<OomMatcher>) -> Self {
        let connect = Duration::from_millis(cfg.connect_timeout_ms);
        let probe = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(Duration::from_millis(cfg.probe_timeout_ms))
            .build()
            .expect("failed to build probe client");
        let unary = reqwest::Client::builder()
            .connect_timeout(connect)
            .build()
            .expect("failed to build unary client");
        let stream = reqwest::Client::builder()
            .connect_timeout(connect)
            .build()
            .expect("failed to build streaming client");
        Self { probe, unary, stream, oom }
    }

    /// `GET /api/tags` — models the node can serve. Short timeout.
    pub async fn tags(&self, node: &Node) -> Result<Vec<ModelInfo>, ClientError> {
        self.tags_at(&node.base_url()).await
    }

    /// Tags probe against a bare address, for discovery of nodes that are not
    /// in the registry yet. `timeout` overrides the probe client's default.
    pub async fn tags_at_with_timeout(
        &self,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Vec<ModelInfo>, ClientError> {
        let url = format!("{base_url}/api/tags");
        let response = self
            .probe
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::transport)?;
        let parsed: TagsResponse = Self::decode(response).await?;
        Ok(parsed.models)
    }

    pub async fn tags_at(&self, base_url: &str) -> Result<Vec<ModelInfo>, ClientError> {
        let url = format!("{base_url}/api/tags");
        let response = self.probe.get(&url).send().await.map_err(ClientError::transport)?;
        let parsed: TagsResponse = Self::decode(response).await?;
        Ok(parsed.models)
    }

    /// `GET /api/ps` — models currently resident on the node. Short timeout.
    pub async fn running(&self, node: &Node) -> Result<Vec<RunningModel>, ClientError> {
        let url = format!("{}/api/ps", node.base_url());
        let response = self.probe.get(&url).send().await.map_err(ClientError::transport)?;
        let parsed: RunningResponse = Self::decode(response).await?;
        Ok(parsed.models)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        let text = response.text().await.map_err(ClientError::transport)?;
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }

    /// `POST /api/generate` with `stream=false`. The payload passes through
    /// untouched apart from the `model`/`stream` fields the router rewrites.
    pub async fn generate(
        &self,
        node: &Node,
        payload: Value,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/api/generate", node.base_url());
        let work = async {
            let response = self
                .unary
                .post(&url)
                .timeout(attempt_timeout)
                .json(&payload)
                .send()
                .await
                .map_err(ClientError::transport)?;

            let status = response.status();
            let text = response.text().await.map_err(ClientError::transport)?;
            if !status.is_success() {
                return Err(self.classify_failure(status.as_u16(), text));
            }
            serde_json::from_str(&text).map_err(|e| ClientError::MalformedResponse(e.to_string()))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Canceled),
            result = work => result,
        }
    }

    /// `POST /api/generate` with `stream=true`, returning a [`ChunkStream`].
    ///
    /// `idle_timeout` bounds the gap between consecutive chunks; `deadline`
    /// bounds the whole stream. Both fire as [`ClientError::Timeout`].
    pub async fn generate_stream(
        &self,
        node: &Node,
        payload: Value,
        idle_timeout: Duration,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ClientError> {
        let url = format!("{}/api/generate", node.base_url());

        let send = async {
            let response = self
                .stream
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(ClientError::transport)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(self.classify_failure(status.as_u16(), body));
            }
            Ok(response)
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Canceled),
            _ = tokio::time::sleep_until(deadline) => return Err(ClientError::Timeout),
            r = send => r?,
        };

        let (tx, rx) = mpsc::channel(32);
        // Child token: cancels with the caller's token, and independently when
        // the ChunkStream is dropped.
        let relay_cancel = cancel.child_token();
        let guard = relay_cancel.clone().drop_guard();
        tokio::spawn(relay(
            Box::pin(response.bytes_stream()),
            tx,
            relay_cancel,
            idle_timeout,
            deadline,
            Arc::clone(&self.oom),
        ));

        Ok(ChunkStream { rx, _relay: guard })
    }

    /// Classify a non-2xx response, promoting OOM-looking bodies.
    fn classify_failure(&self, status: u16, body: String) -> ClientError {
        if self.oom.matches(&body) {
            ClientError::OomSuspected(body)
        } else {
            ClientError::HttpStatus { status, body }
        }
    }
}

/// Background task pumping backend bytes into decoded chunks.
///
/// Ends on the `done` marker, a clean close, the first error, idle timeout,
/// deadline, or cancellation. After an error nothing further is sent.
async fn relay(
    mut bytes: impl Stream<Item = reqwest::Result<Bytes>> + Unpin,
    tx: mpsc::Sender<Result<GenerateChunk, ClientError>>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    deadline: tokio::time::Instant,
    oom: Arc<OomMatcher>,
) {
    let mut buffer = String::new();

    loop {
        let wake_at = deadline.min(tokio::time::Instant::now() + idle_timeout);

        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Err(ClientError::Canceled)).await;
                return;
            }
            _ = tokio::time::sleep_until(wake_at) => {
                let _ = tx.send(Err(ClientError::Timeout)).await;
                return;
            }
            chunk = bytes.next() => chunk,
        };

        match chunk {
            Some(Ok(data)) => {
                buffer.push_str(&String::from_utf8_lossy(&data));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_owned();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    match decode_line(&line, &oom) {
                        Ok(chunk) => {
                            let done = chunk.done;
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(ClientError::transport(e))).await;
                return;
            }
            // Clean close without a done marker still terminates the stream.
            None => return,
        }
    }
}

fn decode_line(line: &str, oom: &OomMatcher) -> Result<GenerateChunk, ClientError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|_| ClientError::MalformedResponse(format!("non-JSON stream line: {line}")))?;

    // In-band error objects are how backends report mid-stream failures.
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(if oom.matches(message) {
            ClientError::OomSuspected(message.to_owned())
        } else {
            ClientError::MalformedResponse(format!("backend error: {message}"))
        });
    }

    serde_json::from_value(value)
        .map_err(|e| ClientError::MalformedResponse(format!("bad stream chunk: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> NodeClient {
        let catalog = crate::catalog::ModelCatalog::new(&CatalogConfig::default()).unwrap();
        NodeClient::new(&RequestConfig::default(), catalog.oom_matcher())
    }

    fn node_for(server: &MockServer) -> Node {
        let addr = server.address();
        Node::new(addr.ip().to_string(), addr.port())
    }

    async fn collect(mut stream: ChunkStream) -> Vec<Result<GenerateChunk, ClientError>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    // -----------------------------------------------------------------------
    // tags / running
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tags_returns_model_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {"name": "small-1b", "size": 900000000u64},
                    {"name": "med-13b", "size": 8000000000u64}
                ]
            })))
            .mount(&server)
            .await;

        let models = client().tags(&node_for(&server)).await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "small-1b");
        assert_eq!(models[1].size, 8_000_000_000);
    }

    #[tokio::test]
    async fn tags_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client().tags(&node_for(&server)).await.unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn tags_against_dead_address_is_unreachable() {
        // Port 1 on loopback: nothing listens there.
        let err = client()
            .tags_at_with_timeout("http://127.0.0.1:1", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClientError::Unreachable(_) | ClientError::Timeout),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn running_parses_vram_and_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ps"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{
                    "name": "med-13b",
                    "size": 8000000000u64,
                    "size_vram": 7500000000u64,
                    "expires_at": "2099-01-01T00:00:00Z"
                }]
            })))
            .mount(&server)
            .await;

        let running = client().running(&node_for(&server)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].size_vram, 7_500_000_000);
        assert_eq!(running[0].expires_at.as_deref(), Some("2099-01-01T00:00:00Z"));
    }

    // -----------------------------------------------------------------------
    // generate (unary)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn generate_returns_backend_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "small-1b", "response": "hello", "done": true
            })))
            .mount(&server)
            .await;

        let value = client()
            .generate(
                &node_for(&server),
                json!({"model": "small-1b", "prompt": "hi", "stream": false}),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value["response"], "hello");
    }

    #[tokio::test]
    async fn generate_classifies_4xx_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let err = client()
            .generate(
                &node_for(&server),
                json!({"model": "x"}),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn generate_promotes_oom_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("CUDA error: out of memory"),
            )
            .mount(&server)
            .await;

        let err = client()
            .generate(
                &node_for(&server),
                json!({"model": "big-70b"}),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::OomSuspected(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn generate_rejects_non_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json {{{"))
            .mount(&server)
            .await;

        let err = client()
            .generate(
                &node_for(&server),
                json!({"model": "x"}),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn generate_honors_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"done": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client()
            .generate(
                &node_for(&server),
                json!({"model": "x"}),
                Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Canceled));
    }

    #[tokio::test]
    async fn generate_times_out_per_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"done": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = client()
            .generate(
                &node_for(&server),
                json!({"model": "x"}),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    // -----------------------------------------------------------------------
    // generate_stream
    // -----------------------------------------------------------------------

    fn ndjson(lines: &[Value]) -> String {
        let mut body = String::new();
        for line in lines {
            body.push_str(&line.to_string());
            body.push('\n');
        }
        body
    }

    #[tokio::test]
    async fn stream_yields_chunks_in_backend_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"response": "Hel", "done": false}),
                json!({"response": "lo", "done": false}),
                json!({"response": "", "done": true, "eval_count": 2}),
            ])))
            .mount(&server)
            .await;

        let stream = client()
            .generate_stream(
                &node_for(&server),
                json!({"model": "small-1b", "prompt": "hi", "stream": true}),
                Duration::from_secs(5),
                tokio::time::Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let items = collect(stream).await;
        assert_eq!(items.len(), 3);
        let texts: Vec<String> = items
            .iter()
            .map(|r| r.as_ref().unwrap().response.clone())
            .collect();
        assert_eq!(texts, vec!["Hel", "lo", ""]);
        assert!(items[2].as_ref().unwrap().done);
        // Unknown fields are preserved for proxying
        assert_eq!(items[2].as_ref().unwrap().rest["eval_count"], 2);
    }

    #[tokio::test]
    async fn stream_ends_in_error_after_non_json_line() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"response\": \"ok\", \"done\": false}\ngarbage line\n",
            ))
            .mount(&server)
            .await;

        let stream = client()
            .generate_stream(
                &node_for(&server),
                json!({"model": "x", "stream": true}),
                Duration::from_secs(5),
                tokio::time::Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let items = collect(stream).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1].as_ref().unwrap_err(),
            ClientError::MalformedResponse(_)
        ));
    }

    #[tokio::test]
    async fn stream_classifies_in_band_oom_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"error\": \"llama runner terminated: out of memory\"}\n",
            ))
            .mount(&server)
            .await;

        let stream = client()
            .generate_stream(
                &node_for(&server),
                json!({"model": "big-70b", "stream": true}),
                Duration::from_secs(5),
                tokio::time::Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let items = collect(stream).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().unwrap_err(),
            ClientError::OomSuspected(_)
        ));
    }

    #[tokio::test]
    async fn stream_start_failure_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let err = client()
            .generate_stream(
                &node_for(&server),
                json!({"model": "x", "stream": true}),
                Duration::from_secs(5),
                tokio::time::Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn stream_deadline_bounds_slow_response_start() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"done\": true}\n")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = client()
            .generate_stream(
                &node_for(&server),
                json!({"model": "x", "stream": true}),
                Duration::from_secs(5),
                tokio::time::Instant::now() + Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }
}
