//! Composer context staged before a message is submitted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Longest message the server accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Reference to a file previously uploaded to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub original_name: String,
    pub saved_name: String,
    pub saved_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Body of a chat submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_table: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploaded_files: Vec<UploadedFile>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub message_type: String,
}

/// Compose error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("Message is empty")]
    Empty,
    #[error("Message too long: {0} characters (max {MAX_MESSAGE_CHARS})")]
    TooLong(usize),
}

/// Transient state gathered while the user composes a message.
///
/// Reset whenever the session changes; nothing here outlives a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposerContext {
    /// Selected data source (table) id.
    pub selected_data_source: Option<String>,

    /// Files uploaded and waiting to go out with the next message.
    #[serde(default)]
    pub staged_uploads: Vec<UploadedFile>,

    /// Arbitrary metadata forwarded with the next message.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ComposerContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_data_source(&mut self, id: impl Into<String>) {
        self.selected_data_source = Some(id.into());
    }

    pub fn stage_upload(&mut self, file: UploadedFile) {
        if !self
            .staged_uploads
            .iter()
            .any(|f| f.saved_path == file.saved_path)
        {
            self.staged_uploads.push(file);
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Build a request from `content`, draining staged uploads.
    ///
    /// The data source selection persists across messages.
    ///
    /// # Errors
    /// Returns error if the content is blank or over [`MAX_MESSAGE_CHARS`].
    pub fn take_request(&mut self, content: &str) -> Result<ChatRequest, ComposeError> {
        let content = content.trim();
        if content.is_empty() && self.staged_uploads.is_empty() {
            return Err(ComposeError::Empty);
        }
        let len = content.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(ComposeError::TooLong(len));
        }

        Ok(ChatRequest {
            content: content.to_string(),
            selected_table: self.selected_data_source.clone(),
            uploaded_files: std::mem::take(&mut self.staged_uploads),
            metadata: std::mem::take(&mut self.metadata),
            message_type: "user_message".to_string(),
        })
    }

    /// Put back what `take_request` drained, after a failed submission.
    ///
    /// Anything staged since then stays; restored uploads go first and
    /// newer metadata values win.
    pub fn restage(&mut self, request: ChatRequest) {
        let newer = std::mem::replace(&mut self.staged_uploads, request.uploaded_files);
        for file in newer {
            self.stage_upload(file);
        }
        for (key, value) in request.metadata {
            self.metadata.entry(key).or_insert(value);
        }
    }

    /// Drop everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selected_data_source.is_none()
            && self.staged_uploads.is_empty()
            && self.metadata.is_empty()
    }
}
