//! Network side of the thought-chain client.
//!
//! Provides:
//! - Wire DTOs for the outbound request surface
//! - `HttpSessionApi` - reqwest implementation of `SessionApi`
//! - `SseTransport` - event-stream implementation of `StreamTransport`
//! - `ConnectionManager` - timeout, bounded exponential backoff and teardown

pub mod connection;
pub mod http;
pub mod protocol;
pub mod sse;

pub use connection::{ConnectionManager, ConnectionState, SessionFrame};
pub use http::HttpSessionApi;
pub use protocol::{CreateSessionResponse, ErrorBody, SubmitResponse};
pub use sse::SseTransport;
