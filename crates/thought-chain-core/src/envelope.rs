//! Wire taxonomy: raw frames, envelopes, and typed stream events.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{Attachment, GeneratedFile, SessionId};

/// One raw server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub id: Option<String>,
    /// SSE `event:` name.
    pub event: String,
    /// Concatenated `data:` lines.
    pub data: String,
}

impl Frame {
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: event.into(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Closed message-type taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    RoundStart,
    RoundEnd,
    RoundError,
    PostStart,
    PostEnd,
    PostError,
    PostMessageUpdate,
    PostStatusUpdate,
    PostAttachmentUpdate,
    PostSendToUpdate,
    ChatCompleted,
    Error,
    Heartbeat,
    FileGenerated,
    SessionCreated,
    Shutdown,
    /// Anything outside the taxonomy.
    Generic,
}

impl EnvelopeKind {
    /// Look up a wire type name. Unknown names map to `None`.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "round_start" => Self::RoundStart,
            "round_end" => Self::RoundEnd,
            "round_error" => Self::RoundError,
            "post_start" => Self::PostStart,
            "post_end" => Self::PostEnd,
            "post_error" => Self::PostError,
            "post_message_update" => Self::PostMessageUpdate,
            "post_status_update" => Self::PostStatusUpdate,
            "post_attachment_update" => Self::PostAttachmentUpdate,
            "post_send_to_update" => Self::PostSendToUpdate,
            "chat_completed" => Self::ChatCompleted,
            "error" => Self::Error,
            "heartbeat" => Self::Heartbeat,
            "file_generated" => Self::FileGenerated,
            "session_created" => Self::SessionCreated,
            "shutdown" => Self::Shutdown,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundStart => "round_start",
            Self::RoundEnd => "round_end",
            Self::RoundError => "round_error",
            Self::PostStart => "post_start",
            Self::PostEnd => "post_end",
            Self::PostError => "post_error",
            Self::PostMessageUpdate => "post_message_update",
            Self::PostStatusUpdate => "post_status_update",
            Self::PostAttachmentUpdate => "post_attachment_update",
            Self::PostSendToUpdate => "post_send_to_update",
            Self::ChatCompleted => "chat_completed",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::FileGenerated => "file_generated",
            Self::SessionCreated => "session_created",
            Self::Shutdown => "shutdown",
            Self::Generic => "generic",
        }
    }
}

/// Frame or payload parse error.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON in `{event}` event: {source}")]
    Json {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{event}` payload is not a JSON object")]
    NotObject { event: String },
    #[error("Malformed `{event}` payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ParseError {
    /// Wire event name the error relates to.
    #[must_use]
    pub fn event(&self) -> &str {
        match self {
            Self::Json { event, .. } | Self::NotObject { event } => event.as_str(),
            Self::Payload { event, .. } => *event,
        }
    }
}

/// A parsed, typed message from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub kind: EnvelopeKind,
    /// Type name as received.
    pub wire_type: String,
    pub payload: Map<String, Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
}

impl Envelope {
    /// Parse a raw frame.
    ///
    /// The type comes from the SSE event name; when that is empty or the
    /// default `message`, the payload's `type` field is used instead. The
    /// payload's own `type` is otherwise ignored (several payloads reuse it).
    ///
    /// # Errors
    /// Returns error if `data` is not a JSON object.
    pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
        let event = frame.event.trim();
        let data = frame.data.trim();

        let value: Value = if data.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(data).map_err(|source| ParseError::Json {
                event: event.to_string(),
                source,
            })?
        };
        let Value::Object(payload) = value else {
            return Err(ParseError::NotObject {
                event: event.to_string(),
            });
        };

        let wire_type = if event.is_empty() || event == "message" {
            payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("message")
                .to_string()
        } else {
            event.to_string()
        };
        let kind = EnvelopeKind::from_wire(&wire_type).unwrap_or(EnvelopeKind::Generic);

        let id = frame
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("local_{}", Uuid::new_v4().simple()));

        Ok(Self {
            id,
            kind,
            wire_type,
            timestamp: payload.get("timestamp").and_then(parse_timestamp),
            session_id: payload
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload,
        })
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            ParseError::Payload {
                event: self.kind.as_str(),
                source,
            }
        })
    }

    fn text(&self, key: &str) -> Option<String> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Accepts epoch seconds or an ISO-8601 string (with or without offset).
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            #[allow(clippy::cast_possible_truncation)]
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}

#[derive(Deserialize)]
struct PostRef {
    post_id: String,
}

#[derive(Deserialize)]
struct PostStartPayload {
    post_id: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct PostMessagePayload {
    post_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    is_complete: bool,
}

#[derive(Deserialize)]
struct AttachmentPayload {
    post_id: String,
    attachment: Attachment,
}

#[derive(Deserialize)]
struct ChatCompletedPayload {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    files: Vec<GeneratedFile>,
}

#[derive(Deserialize)]
struct FileGeneratedPayload {
    file_path: String,
    #[serde(default)]
    file_type: Option<String>,
}

/// Typed stream event consumed by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RoundStart {
        round_id: Option<String>,
    },
    RoundEnd {
        round_id: Option<String>,
    },
    /// `round_error` or `error`.
    RoundError {
        error: String,
    },
    PostStart {
        post_id: String,
        role: Option<String>,
        title: String,
    },
    PostEnd {
        post_id: String,
        final_message: Option<String>,
    },
    PostError {
        post_id: String,
        error: String,
    },
    PostMessageUpdate {
        post_id: String,
        content: String,
        is_complete: bool,
    },
    PostStatusUpdate {
        post_id: String,
        status: String,
    },
    PostSendToUpdate {
        post_id: String,
        send_to: String,
    },
    PostAttachmentUpdate {
        post_id: String,
        attachment: Attachment,
    },
    ChatCompleted {
        response: String,
        files: Vec<GeneratedFile>,
    },
    FileGenerated(GeneratedFile),
    Shutdown {
        message: String,
    },
    /// Heartbeats, session notices and unknown types: liveness only.
    Liveness,
}

const UNKNOWN_ERROR: &str = "未知错误";

impl StreamEvent {
    /// Decode the typed event carried by an envelope.
    ///
    /// # Errors
    /// Returns error if a known event type lacks required fields.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ParseError> {
        Ok(match envelope.kind {
            EnvelopeKind::RoundStart => Self::RoundStart {
                round_id: envelope.text("round_id"),
            },
            EnvelopeKind::RoundEnd => Self::RoundEnd {
                round_id: envelope.text("round_id"),
            },
            EnvelopeKind::RoundError | EnvelopeKind::Error => Self::RoundError {
                error: envelope
                    .text("error")
                    .or_else(|| envelope.text("message"))
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            },
            EnvelopeKind::PostStart => {
                let p: PostStartPayload = envelope.decode()?;
                let title = p
                    .message
                    .clone()
                    .or_else(|| p.role.clone())
                    .unwrap_or_default();
                Self::PostStart {
                    post_id: p.post_id,
                    role: p.role,
                    title,
                }
            }
            EnvelopeKind::PostEnd => {
                let p: PostRef = envelope.decode()?;
                Self::PostEnd {
                    post_id: p.post_id,
                    final_message: envelope.text("final_message"),
                }
            }
            EnvelopeKind::PostError => {
                let p: PostRef = envelope.decode()?;
                Self::PostError {
                    post_id: p.post_id,
                    error: envelope
                        .text("error")
                        .or_else(|| envelope.text("message"))
                        .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                }
            }
            EnvelopeKind::PostMessageUpdate => {
                let p: PostMessagePayload = envelope.decode()?;
                Self::PostMessageUpdate {
                    post_id: p.post_id,
                    content: p.content,
                    is_complete: p.is_complete,
                }
            }
            EnvelopeKind::PostStatusUpdate => {
                let p: PostRef = envelope.decode()?;
                Self::PostStatusUpdate {
                    post_id: p.post_id,
                    status: envelope.text("status").unwrap_or_default(),
                }
            }
            EnvelopeKind::PostSendToUpdate => {
                let p: PostRef = envelope.decode()?;
                Self::PostSendToUpdate {
                    post_id: p.post_id,
                    send_to: envelope.text("send_to").unwrap_or_default(),
                }
            }
            EnvelopeKind::PostAttachmentUpdate => {
                let p: AttachmentPayload = envelope.decode()?;
                Self::PostAttachmentUpdate {
                    post_id: p.post_id,
                    attachment: p.attachment,
                }
            }
            EnvelopeKind::ChatCompleted => {
                let p: ChatCompletedPayload = envelope.decode()?;
                Self::ChatCompleted {
                    response: p.response.or(p.message).unwrap_or_default(),
                    files: p.files,
                }
            }
            EnvelopeKind::FileGenerated => {
                let p: FileGeneratedPayload = envelope.decode()?;
                Self::FileGenerated(GeneratedFile::from_path(&p.file_path, p.file_type))
            }
            EnvelopeKind::Shutdown => Self::Shutdown {
                message: envelope.text("message").unwrap_or_default(),
            },
            EnvelopeKind::Heartbeat | EnvelopeKind::SessionCreated | EnvelopeKind::Generic => {
                Self::Liveness
            }
        })
    }
}
