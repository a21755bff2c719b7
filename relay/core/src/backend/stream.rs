//! Response Streams
//!
//! A [`ResponseStream`] is the caller's end of a streaming generation. A pump
//! task owns the HTTP body, decodes native chunks and forwards normalized
//! [`GenerateContentResponse`] deltas through a bounded channel.
//!
//! ```text
//! FrameStream<T> --(pump task)--> mpsc --> ResponseStream --> caller
//!                      ^
//!                      +-- CancellationToken (close / drop)
//! ```
//!
//! The body is dropped when the pump task exits, which happens on exactly one
//! of: native completion, end of body, a transport error, an error frame from
//! the backend, cancellation, or the receiver going away.
//!
//! An error frame ends the stream with an error item, never a final chunk.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::contracts::{GenerateContentResponse, Usage};
use crate::error::{GatewayError, Result};
use crate::transport::FrameStream;

/// Buffered chunks between the pump task and the consumer
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Status attached to errors a backend sends inside a 200 stream
const IN_BAND_ERROR_STATUS: u16 = 500;

/// What one native chunk contributes to the stream
#[derive(Debug, Default, PartialEq)]
pub struct ChunkUpdate {
    /// Newly generated text
    pub text: Option<String>,
    /// Token accounting carried by this chunk
    pub usage: Option<Usage>,
    /// Native completion signal
    pub done: bool,
    /// Failure the backend reported in-band after the headers
    pub error: Option<String>,
}

/// A backend's native streaming chunk
pub trait StreamChunk: DeserializeOwned + Send + 'static {
    /// Normalize into text / usage / completion
    fn into_update(self) -> ChunkUpdate;
}

/// Caller-facing stream of generation chunks
///
/// Yields delta chunks followed by exactly one final chunk with
/// `finish_reason = stop`, or an error item if the stream fails midway.
/// Not restartable.
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<GenerateContentResponse>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ResponseStream {
    fn new(rx: mpsc::Receiver<Result<GenerateContentResponse>>, cancel: CancellationToken) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            rx,
            cancel,
            _guard: guard,
        }
    }

    /// Start a pump task over a native frame stream
    pub fn spawn<T: StreamChunk>(frames: FrameStream<T>, model: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(pump(frames, model.into(), tx, cancel.clone()));
        Self::new(rx, cancel)
    }

    /// Stream over already-produced items
    pub fn from_results(items: Vec<Result<GenerateContentResponse>>) -> Self {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            if tx.try_send(item).is_err() {
                break;
            }
        }
        Self::new(rx, CancellationToken::new())
    }

    /// Stop the stream and release the connection
    ///
    /// Idempotent. Items already buffered are discarded.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    /// Token that cancels this stream from elsewhere
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether `close` was called or the handle was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next chunk, or `None` once the stream has ended
    pub async fn next_chunk(&mut self) -> Option<Result<GenerateContentResponse>> {
        self.rx.recv().await
    }

    /// Drain the stream into one complete response
    ///
    /// # Errors
    ///
    /// Returns the first error item, or `Cancelled` if the stream ended
    /// without a final chunk.
    pub async fn into_response(mut self) -> Result<GenerateContentResponse> {
        let mut content = String::new();
        while let Some(item) = self.next_chunk().await {
            let chunk = item?;
            content.push_str(&chunk.content);
            if chunk.is_final() {
                return Ok(GenerateContentResponse { content, ..chunk });
            }
        }
        Err(GatewayError::Cancelled)
    }
}

impl Stream for ResponseStream {
    type Item = Result<GenerateContentResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn pump<T: StreamChunk>(
    mut frames: FrameStream<T>,
    model: String,
    tx: mpsc::Sender<Result<GenerateContentResponse>>,
    cancel: CancellationToken,
) {
    let mut usage = None;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(model = %model, "Stream cancelled");
                return;
            }
            next = frames.next_frame() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let update = chunk.into_update();
                if let Some(message) = update.error {
                    tracing::warn!(model = %model, error = %message, "Backend reported an error midway");
                    let err = GatewayError::Api {
                        backend: frames.backend(),
                        status: IN_BAND_ERROR_STATUS,
                        message,
                    };
                    frames.close();
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                if update.usage.is_some() {
                    usage = update.usage;
                }
                if let Some(text) = update.text.filter(|t| !t.is_empty()) {
                    let delta = GenerateContentResponse::delta(model.clone(), text);
                    if tx.send(Ok(delta)).await.is_err() {
                        // receiver dropped
                        return;
                    }
                }
                if update.done {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(model = %model, error = %e, "Stream failed midway");
                let _ = tx.send(Err(e)).await;
                return;
            }
            None => break,
        }
    }

    frames.close();
    let _ = tx.send(Ok(GenerateContentResponse::finished(model, usage))).await;
}
