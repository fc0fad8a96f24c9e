//! Server-sent-events transport.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header::HeaderMap};
use thought_chain_core::{ClientConfig, Frame, FrameStream, StreamTransport, TransportError};

use crate::http::{HeaderError, build_headers, join_url};

/// Opens `GET {base}/chat/stream/{session_id}` as an event stream.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    base_url: String,
    headers: HeaderMap,
}

impl SseTransport {
    /// Create from client configuration.
    ///
    /// # Errors
    /// Returns error if an auth header is invalid.
    pub fn new(config: &ClientConfig) -> Result<Self, HeaderError> {
        let mut headers = build_headers(&config.auth_headers)?;
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/event-stream"),
        );
        Ok(Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            headers,
        })
    }

    fn stream_url(&self, session_id: &str) -> String {
        join_url(&self.base_url, &format!("chat/stream/{session_id}"))
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn open(&self, session_id: &str) -> Result<FrameStream, TransportError> {
        let url = self.stream_url(session_id);
        tracing::debug!(%url, "opening event stream");

        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(TransportError::AuthExpired(response.status().as_u16()));
            }
            StatusCode::NOT_FOUND => return Err(TransportError::NotFound),
            s if !s.is_success() => return Err(TransportError::Status(s.as_u16())),
            _ => {}
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|event| -> Result<Frame, TransportError> {
                let event = event.map_err(|e| TransportError::Stream(e.to_string()))?;
                let frame = Frame::new(event.event, event.data);
                Ok(if event.id.is_empty() {
                    frame
                } else {
                    frame.with_id(event.id)
                })
            });

        Ok(Box::pin(stream))
    }
}
