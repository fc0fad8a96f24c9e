//! Wire DTOs for the outbound request surface.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thought_chain_core::{Session, envelope::parse_timestamp};

/// Body of `POST /session/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<Value>,
}

impl From<CreateSessionResponse> for Session {
    fn from(resp: CreateSessionResponse) -> Self {
        Self {
            created_at: resp
                .created_at
                .as_ref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            id: resp.session_id,
            conversation_id: resp.conversation_id,
        }
    }
}

/// Body of `POST /chat/message/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SubmitResponse {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status == "accepted"
    }
}

/// Error body; the server uses either `detail` or `error`/`message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// Best human-readable text from a raw body.
    #[must_use]
    pub fn describe(raw: &str) -> String {
        serde_json::from_str::<Self>(raw)
            .ok()
            .and_then(|body| body.detail.or(body.message).or(body.error))
            .unwrap_or_else(|| raw.trim().to_string())
    }
}
