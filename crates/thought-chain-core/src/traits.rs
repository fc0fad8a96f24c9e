//! Core traits for the outbound request surface and the event stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChatRequest, Frame};

/// Server-assigned session identifier.
pub type SessionId = String;

/// Status of the streaming connection bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Transport is being opened.
    Connecting,
    /// Transport is open and delivering events.
    Connected,
    /// No transport (never connected or torn down).
    #[default]
    Disconnected,
    /// Last attempt failed; a retry may be pending.
    Error,
}

/// A logical session as created by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Server-side conversation id, if reported.
    pub conversation_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Outbound request error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Authentication expired (HTTP {0})")]
    AuthExpired(u16),
    #[error("Session not found")]
    NotFound,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether this error means the session can no longer be used.
    #[must_use]
    pub const fn invalidates_session(&self) -> bool {
        matches!(self, Self::AuthExpired(_) | Self::NotFound)
    }
}

/// Trait for the non-streamed request surface.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create a new server-side session.
    async fn create_session(&self) -> Result<Session, ApiError>;

    /// Delete a session.
    async fn delete_session(&self, id: &str) -> Result<(), ApiError>;

    /// Liveness probe for a session.
    async fn heartbeat(&self, id: &str) -> Result<(), ApiError>;

    /// Submit a user message; the reply arrives on the event stream.
    async fn submit_message(&self, id: &str, request: &ChatRequest) -> Result<(), ApiError>;
}

/// Stream transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authentication expired (HTTP {0})")]
    AuthExpired(u16),
    #[error("Stream endpoint not found")]
    NotFound,
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Timed out opening stream")]
    Timeout,
}

impl TransportError {
    /// Whether an automatic reconnect can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthExpired(_) | Self::NotFound)
    }
}

/// Stream of raw frames from an open transport.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Trait for opening the session-scoped event stream.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Open the stream for a session. Resolves once the transport is open.
    async fn open(&self, session_id: &str) -> Result<FrameStream, TransportError>;
}
