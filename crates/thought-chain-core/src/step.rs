//! Steps ("posts") and their attachments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DescriptionMode;

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Wait,
    Process,
    Finish,
    Error,
}

/// Attachment type reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttachmentKind {
    PlanReasoning,
    Plan,
    CurrentPlanStep,
    Thought,
    ExecutionResult,
    ExecutionStatus,
    ReplyContent,
    Text,
    ArtifactPaths,
    Other(String),
}

impl AttachmentKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlanReasoning => "plan_reasoning",
            Self::Plan => "plan",
            Self::CurrentPlanStep => "current_plan_step",
            Self::Thought => "thought",
            Self::ExecutionResult => "execution_result",
            Self::ExecutionStatus => "execution_status",
            Self::ReplyContent => "reply_content",
            Self::Text => "text",
            Self::ArtifactPaths => "artifact_paths",
            Self::Other(name) => name,
        }
    }

    /// Which step fields this attachment type drives.
    #[must_use]
    pub const fn field_target(&self) -> Option<FieldTarget> {
        match self {
            Self::PlanReasoning => Some(FieldTarget::Description { label: "推理过程" }),
            Self::Plan => Some(FieldTarget::Description { label: "计划制定" }),
            Self::CurrentPlanStep => Some(FieldTarget::Description { label: "当前步骤" }),
            Self::Thought => Some(FieldTarget::Description { label: "思考" }),
            Self::ExecutionResult => Some(FieldTarget::ContentWithMarker { marker: "完成" }),
            _ => None,
        }
    }
}

impl From<String> for AttachmentKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "plan_reasoning" => Self::PlanReasoning,
            "plan" => Self::Plan,
            "current_plan_step" => Self::CurrentPlanStep,
            "thought" => Self::Thought,
            "execution_result" => Self::ExecutionResult,
            "execution_status" => Self::ExecutionStatus,
            "reply_content" => Self::ReplyContent,
            "text" => Self::Text,
            "artifact_paths" => Self::ArtifactPaths,
            _ => Self::Other(value),
        }
    }
}

impl From<AttachmentKind> for String {
    fn from(value: AttachmentKind) -> Self {
        match value {
            AttachmentKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step fields updated by an attachment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    /// Title becomes `label`; attachment text merges into the description.
    Description { label: &'static str },
    /// Attachment text becomes the content; `marker` merges into the description.
    ContentWithMarker { marker: &'static str },
}

/// Typed, incrementally updated content belonging to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "is_end")]
    pub is_complete: bool,
}

/// Result of merging an attachment into a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Replaced,
    /// Identical to the entry already present.
    Unchanged,
}

/// One unit of agent work inside a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub description: String,
    pub content: String,
    /// Status as reported on the wire.
    pub status: StepStatus,
    /// Status to show; may be forced to `Error` by output classification.
    pub display_status: StepStatus,
    pub role: Option<String>,
    pub send_to: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Step {
    /// A freshly started step.
    #[must_use]
    pub fn new(id: impl Into<String>, role: Option<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            content: String::new(),
            status: StepStatus::Process,
            display_status: StepStatus::Process,
            role,
            send_to: None,
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn attachment(&self, id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.id == id)
    }

    /// Merge by attachment id: replace in place, or append if new.
    pub fn merge_attachment(&mut self, attachment: Attachment) -> MergeOutcome {
        match self.attachments.iter_mut().find(|a| a.id == attachment.id) {
            Some(existing) if *existing == attachment => MergeOutcome::Unchanged,
            Some(existing) => {
                *existing = attachment;
                MergeOutcome::Replaced
            }
            None => {
                self.attachments.push(attachment);
                MergeOutcome::Appended
            }
        }
    }

    /// Update title/description/content from an attachment per its field target.
    pub fn apply_attachment_fields(
        &mut self,
        attachment: &Attachment,
        mode: DescriptionMode,
        separator: &str,
    ) {
        match attachment.kind.field_target() {
            Some(FieldTarget::Description { label }) => {
                label.clone_into(&mut self.title);
                mode.merge(&mut self.description, &attachment.content, separator);
            }
            Some(FieldTarget::ContentWithMarker { marker }) => {
                attachment.content.clone_into(&mut self.content);
                mode.merge(&mut self.description, marker, separator);
            }
            None => {}
        }
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.status, StepStatus::Finish | StepStatus::Error)
    }
}
