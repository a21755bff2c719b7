//! Shared fixtures for integration tests
//!
//! [`FakeServer`] is a minimal HTTP/1.1 server on a loopback port that replays
//! canned responses per `(method, path)` and records every request it sees.
//! Each response is sent with `Connection: close`, so every call opens a
//! fresh connection.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use relay_core::config::BackendsConfig;
use relay_core::{DiscoveryConfig, RelayConfig, RouterConfig, ServiceConfig};

/// One canned HTTP response
#[derive(Clone, Debug)]
pub struct Canned {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Canned {
    /// JSON body
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    /// Server-sent events, one `data:` frame per payload, then `[DONE]`
    pub fn sse(frames: &[serde_json::Value]) -> Self {
        let mut body = String::new();
        for frame in frames {
            body.push_str("data: ");
            body.push_str(&frame.to_string());
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        Self {
            status: 200,
            content_type: "text/event-stream",
            body,
        }
    }

    /// Newline-delimited JSON, one object per line
    pub fn ndjson(lines: &[serde_json::Value]) -> Self {
        let mut body = String::new();
        for line in lines {
            body.push_str(&line.to_string());
            body.push('\n');
        }
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            body,
        }
    }

    /// Plain error body
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, serde_json::json!({ "error": message }))
    }
}

/// A request the server received
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Recorded {
    /// Body parsed as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

type Routes = HashMap<(String, String), VecDeque<Canned>>;

/// Loopback HTTP server replaying canned responses
pub struct FakeServer {
    addr: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    /// Bind an ephemeral port and start serving
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<Routes>> = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let routes = Arc::clone(&routes);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        let _ = serve(socket, routes, requests).await;
                    });
                }
            })
        };

        Self {
            addr,
            routes,
            requests,
            task,
        }
    }

    /// Queue a response for `method path`
    ///
    /// Responses are served in order; the last one repeats.
    pub fn route(&self, method: &str, path: &str, response: Canned) -> &Self {
        self.routes
            .lock()
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(response);
        self
    }

    /// Port the server listens on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connection settings for a backend served here
    pub fn service_config(&self) -> ServiceConfig {
        local_service(self.port())
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    /// Requests received for one path
    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Stop accepting connections; later calls are refused
    pub async fn stop(&self) {
        self.task.abort();
        // let the abort drop the listener
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    routes: Arc<Mutex<Routes>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    requests.lock().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        body,
    });

    let response = {
        let mut routes = routes.lock();
        match routes.get_mut(&(method, path)) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    }
    .unwrap_or_else(|| Canned::error(404, "no such route"));

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason(response.status),
        response.content_type,
        response.body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(response.body.as_bytes()).await?;
    socket.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Settings for a backend on a loopback port, tuned for fast tests
pub fn local_service(port: u16) -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port,
        enabled: true,
        timeout_ms: 2_000,
        max_retries: 2,
        retry_delay_ms: 10,
    }
}

/// A loopback port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Relay configuration pointing at two loopback ports
pub fn relay_config(openai: ServiceConfig, ollama: ServiceConfig) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.backends = BackendsConfig {
        openai_compatible: openai,
        ollama,
    };
    config.discovery = DiscoveryConfig {
        health_check_timeout_ms: 1_000,
        ..DiscoveryConfig::default()
    };
    config.router = RouterConfig {
        max_retries: 2,
        retry_delay_ms: 10,
        ..RouterConfig::default()
    };
    config
}

/// `/api/tags` body listing `names`
pub fn ollama_tags(names: &[&str]) -> Canned {
    let models: Vec<_> = names
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "modified_at": "2024-05-01T10:00:00Z",
                "size": 3_825_819_519u64,
                "digest": "fe938a131f40",
                "details": { "format": "gguf", "family": "llama", "parameter_size": "7B" }
            })
        })
        .collect();
    Canned::json(200, serde_json::json!({ "models": models }))
}

/// `/v1/models` body listing `ids`
pub fn openai_models(ids: &[&str]) -> Canned {
    let data: Vec<_> = ids
        .iter()
        .map(|id| serde_json::json!({ "id": id, "object": "model", "owned_by": "organization_owner" }))
        .collect();
    Canned::json(200, serde_json::json!({ "object": "list", "data": data }))
}

/// Non-streaming Ollama reply
pub fn ollama_reply(model: &str, text: &str) -> Canned {
    Canned::json(
        200,
        serde_json::json!({
            "model": model,
            "created_at": "2024-05-01T10:00:00Z",
            "response": text,
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 4
        }),
    )
}

/// Non-streaming chat completion
pub fn openai_completion(model: &str, text: &str) -> Canned {
    Canned::json(
        200,
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16 }
        }),
    )
}
