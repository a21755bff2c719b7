//! HTTP Transport Layer
//!
//! Generic plumbing shared by both protocol adapters:
//! - [`HttpTransport`]: JSON request/response with timeouts and bounded retries
//! - [`FrameStream`]: typed frames from an SSE or NDJSON streaming body
//! - [`LineFrameDecoder`]: the incremental line decoder behind `FrameStream`
//!
//! Adapters never touch `reqwest` directly; everything network-shaped is
//! normalized into [`GatewayError`](crate::error::GatewayError) here.

pub mod frame;
pub mod http;

pub use frame::{LineFrame, LineFrameDecoder};
pub use http::{BodyStream, FrameStream, HttpResponse, HttpTransport};
