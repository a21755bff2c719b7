//! HTTP Transport
//!
//! One `HttpTransport` per backend. Handles URL building, per-call timeouts,
//! linear-backoff retries of transient failures, JSON decoding and opening
//! streaming bodies.
//!
//! Failure mapping:
//!
//! | Failure                               | Error                 |
//! |---------------------------------------|-----------------------|
//! | connect refused, DNS, send timeout    | `ServiceUnavailable`  |
//! | non-2xx status                        | `Api { status }`      |
//! | body read fails after headers         | `Network`             |
//! | body is not the expected shape        | `Decode`              |

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::frame::{LineFrame, LineFrameDecoder};
use crate::contracts::{BackendKind, ServiceConfig};
use crate::error::{GatewayError, Result};

/// Longest error body excerpt kept in `GatewayError::Api`
const MAX_ERROR_EXCERPT: usize = 512;

/// A decoded HTTP response
#[derive(Debug)]
pub struct HttpResponse<T> {
    /// Decoded body
    pub data: T,
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_text: String,
    /// Response headers
    pub headers: HeaderMap,
}

/// Error bodies as the two backend families send them
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    /// `{"error": "model 'x' not found"}` (Ollama)
    Flat { error: String },
    /// `{"error": {"message": "..."}}` (OpenAI-compatible)
    Nested { error: ErrorDetail },
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Extract a readable message from an error body
fn error_excerpt(body: &str, status: reqwest::StatusCode) -> String {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Flat { error }) => error,
        Ok(ErrorBody::Nested { error }) => error.message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };

    if message.len() > MAX_ERROR_EXCERPT {
        let mut cut = MAX_ERROR_EXCERPT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &message[..cut])
    } else {
        message
    }
}

/// HTTP client bound to one backend
#[derive(Clone, Debug)]
pub struct HttpTransport {
    backend: BackendKind,
    config: ServiceConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with its own connection pool
    #[must_use]
    pub fn new(backend: BackendKind, config: ServiceConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self::with_client(backend, config, client)
    }

    /// Create a transport sharing an existing client
    #[must_use]
    pub fn with_client(backend: BackendKind, config: ServiceConfig, client: reqwest::Client) -> Self {
        Self {
            backend,
            config,
            client,
        }
    }

    /// Backend this transport talks to
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Connection settings
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// `host:port`
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    fn unavailable(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::ServiceUnavailable {
            backend: self.backend,
            endpoint: self.endpoint(),
            reason: reason.into(),
        }
    }

    fn network(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::Network {
            backend: self.backend,
            endpoint: self.endpoint(),
            message: message.into(),
        }
    }

    /// `GET path` with the configured timeout and retry budget
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<HttpResponse<T>> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    /// `POST path` with a JSON body
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<HttpResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Issue a request with the configured timeout and retry budget
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<HttpResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_with(
            method,
            path,
            body,
            self.config.timeout(),
            self.config.max_retries,
        )
        .await
    }

    /// Issue a request with an explicit timeout and retry budget
    ///
    /// Retries only 5xx, timeouts and network failures; waits
    /// `retry_delay * (attempt + 1)` before each retry.
    pub async fn request_with<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<HttpResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), path, body, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let delay = self.config.retry_delay() * (attempt + 1);
                    tracing::warn!(
                        backend = %self.backend,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient HTTP failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<HttpResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let mut builder = self.client.request(method, &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let call = async {
            let response = builder
                .send()
                .await
                .map_err(|e| self.unavailable(e.to_string()))?;

            let status = response.status();
            let headers = response.headers().clone();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(GatewayError::Api {
                    backend: self.backend,
                    status: status.as_u16(),
                    message: error_excerpt(&text, status),
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| self.network(e.to_string()))?;
            let data = serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode {
                backend: self.backend,
                message: e.to_string(),
            })?;

            Ok(HttpResponse {
                data,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
            })
        };

        tracing::debug!(backend = %self.backend, url = %url, "HTTP request");
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(self.unavailable(format!(
                "timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Open a streaming `POST path`
    ///
    /// Establishing the stream follows the same retry rule as [`request`].
    /// Once headers arrive, the per-call timeout bounds each wait for the next
    /// body chunk.
    ///
    /// [`request`]: HttpTransport::request
    pub async fn stream<T, B>(&self, path: &str, body: &B) -> Result<FrameStream<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match self.open_stream(path, body).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay() * (attempt + 1);
                    tracing::warn!(
                        backend = %self.backend,
                        path,
                        attempt,
                        error = %e,
                        "Stream open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_stream<T, B>(&self, path: &str, body: &B) -> Result<FrameStream<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let timeout = self.config.timeout();
        let request = self.client.post(self.url(path)).json(body).send();

        let response = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.unavailable(e.to_string())),
            Err(_) => {
                return Err(self.unavailable(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                backend: self.backend,
                status: status.as_u16(),
                message: error_excerpt(&text, status),
            });
        }

        let body = response.bytes_stream().map_err(|e| e.to_string()).boxed();
        Ok(FrameStream::new(body, self.backend, self.endpoint(), timeout))
    }
}

/// Raw body chunks, with transport errors flattened to strings
pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, String>>;

/// Typed frames decoded from a streaming body
///
/// Owns the response body; [`close`](FrameStream::close) or dropping the
/// stream releases the connection.
pub struct FrameStream<T> {
    body: BodyStream,
    decoder: LineFrameDecoder,
    backend: BackendKind,
    endpoint: String,
    idle_timeout: Duration,
    finished: bool,
    _frame: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for FrameStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> FrameStream<T> {
    /// Wrap a body stream
    pub fn new(
        body: BodyStream,
        backend: BackendKind,
        endpoint: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            body,
            decoder: LineFrameDecoder::new(),
            backend,
            endpoint: endpoint.into(),
            idle_timeout,
            finished: false,
            _frame: PhantomData,
        }
    }

    /// Next decoded frame
    ///
    /// Returns `None` after `[DONE]`, at end of body, or after an error.
    pub async fn next_frame(&mut self) -> Option<Result<T>> {
        loop {
            if self.finished {
                return None;
            }

            match self.decoder.next_frame::<T>() {
                Some(LineFrame::Data(frame)) => return Some(Ok(frame)),
                Some(LineFrame::Done) => {
                    self.close();
                    return None;
                }
                None => {}
            }

            match tokio::time::timeout(self.idle_timeout, self.body.next()).await {
                Ok(Some(Ok(chunk))) => self.decoder.push(&chunk),
                Ok(Some(Err(message))) => {
                    let err = GatewayError::Network {
                        backend: self.backend,
                        endpoint: self.endpoint.clone(),
                        message,
                    };
                    self.close();
                    return Some(Err(err));
                }
                Ok(None) => {
                    let tail = self.decoder.finish::<T>();
                    self.close();
                    return match tail {
                        Some(LineFrame::Data(frame)) => Some(Ok(frame)),
                        _ => None,
                    };
                }
                Err(_) => {
                    let err = GatewayError::ServiceUnavailable {
                        backend: self.backend,
                        endpoint: self.endpoint.clone(),
                        reason: format!(
                            "no data for {}ms while streaming",
                            self.idle_timeout.as_millis()
                        ),
                    };
                    self.close();
                    return Some(Err(err));
                }
            }
        }
    }

    /// Release the underlying connection
    ///
    /// Idempotent; later calls to `next_frame` return `None`.
    pub fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.body = stream::empty().boxed();
            self.decoder.clear();
        }
    }

    /// Backend the body comes from
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Whether the stream has ended or been closed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
