//! reqwest-backed session API.

use async_trait::async_trait;
use reqwest::{
    Client, Response, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use thiserror::Error;
use thought_chain_core::{
    ApiError, ChatRequest, ClientConfig, HeaderConfig, Session, SessionApi,
};

use crate::protocol::{CreateSessionResponse, ErrorBody, SubmitResponse};

/// Invalid configured header.
#[derive(Debug, Error)]
#[error("Invalid header {name}: {reason}")]
pub struct HeaderError {
    pub name: String,
    pub reason: String,
}

/// Build the header map attached to every request.
///
/// # Errors
/// Returns error if a name or value is not a valid HTTP header.
pub fn build_headers(headers: &[HeaderConfig]) -> Result<HeaderMap, HeaderError> {
    let mut map = HeaderMap::new();
    for HeaderConfig { name, value } in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| HeaderError {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| HeaderError {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Join `base` and `path` with exactly one slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Session API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpSessionApi {
    /// Create from client configuration.
    ///
    /// # Errors
    /// Returns error if an auth header is invalid.
    pub fn new(config: &ClientConfig) -> Result<Self, HeaderError> {
        Ok(Self::with_client(
            Client::new(),
            &config.base_url,
            build_headers(&config.auth_headers)?,
        ))
    }

    #[must_use]
    pub fn with_client(client: Client, base_url: &str, headers: HeaderMap) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            headers,
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::warn!(status = status.as_u16(), "credentials rejected");
                Err(ApiError::AuthExpired(status.as_u16()))
            }
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            s if s.is_success() => Ok(response),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: s.as_u16(),
                    body: ErrorBody::describe(&body),
                })
            }
        }
    }
}

fn network(e: &reqwest::Error) -> ApiError {
    ApiError::Network(e.to_string())
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self) -> Result<Session, ApiError> {
        let response = self
            .client
            .post(self.url("session/create"))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| network(&e))?;
        let body: CreateSessionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        tracing::info!(session_id = %body.session_id, "session created");
        Ok(body.into())
    }

    async fn delete_session(&self, id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.url(&format!("session/{id}")))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| network(&e))?;
        Self::check(response).await?;
        tracing::debug!(session_id = id, "session deleted");
        Ok(())
    }

    async fn heartbeat(&self, id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("session/{id}/heartbeat")))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| network(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn submit_message(&self, id: &str, request: &ChatRequest) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("chat/message/{id}")))
            .headers(self.headers.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| network(&e))?;
        let body: SubmitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if !body.is_accepted() {
            tracing::warn!(session_id = id, status = %body.status, "submission not accepted");
        }
        Ok(())
    }
}
