//! Finalized conversation messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Step, UploadedFile};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// File produced by the agent during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub name: String,
    pub path: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl GeneratedFile {
    /// File announced by a `file_generated` event (path only).
    #[must_use]
    pub fn from_path(path: &str, file_type: Option<String>) -> Self {
        let name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path)
            .to_string();
        Self {
            name,
            path: path.to_string(),
            file_type,
            content: None,
            mime_type: None,
        }
    }
}

/// A finalized turn. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    id: String,
    role: ChatRole,
    text: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    uploads: Vec<UploadedFile>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    files: Vec<GeneratedFile>,
    #[serde(default)]
    is_error: bool,
}

impl ChatMessage {
    /// User message with optional file references.
    #[must_use]
    pub fn user(text: impl Into<String>, uploads: Vec<UploadedFile>) -> Self {
        Self::build(ChatRole::User, text.into(), uploads, Vec::new(), Vec::new(), false)
    }

    /// Assistant message carrying the round's frozen steps.
    #[must_use]
    pub fn assistant(text: impl Into<String>, steps: Vec<Step>, files: Vec<GeneratedFile>) -> Self {
        Self::build(ChatRole::Assistant, text.into(), Vec::new(), steps, files, false)
    }

    /// Synthetic assistant message standing in for a failed round.
    #[must_use]
    pub fn assistant_error(text: impl Into<String>) -> Self {
        Self::build(ChatRole::Assistant, text.into(), Vec::new(), Vec::new(), Vec::new(), true)
    }

    fn build(
        role: ChatRole,
        text: String,
        uploads: Vec<UploadedFile>,
        steps: Vec<Step>,
        files: Vec<GeneratedFile>,
        is_error: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text,
            created_at: Utc::now(),
            uploads,
            steps,
            files,
            is_error,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn role(&self) -> ChatRole {
        self.role
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn uploads(&self) -> &[UploadedFile] {
        &self.uploads
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn files(&self) -> &[GeneratedFile] {
        &self.files
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_error
    }
}
