//! Thought-chain aggregation.
//!
//! Folds typed stream events into an ordered list of live steps and a history
//! of finalized messages. Each round moves `Idle -> Open -> Closed`; the next
//! state is computed by [`Aggregator::next_state`] and the effects on steps
//! and history are applied in [`Aggregator::apply`].
//!
//! Delivery is neither ordered nor deduplicated. Replays are absorbed by
//! skipping envelope ids already seen and by merging attachments by id.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    ChatMessage, ClientConfig, DescriptionMode, GeneratedFile, Step, StepStatus, StreamEvent,
    classify::ErrorClassifier, step::MergeOutcome,
};

/// Envelope ids remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 2048;

/// Round lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoundState {
    /// No round in progress.
    #[default]
    Idle,
    /// Round in progress; the UI shows loading.
    Open { round_id: Option<String> },
    /// Round ended; live steps retained until `chat_completed`.
    Closed { round_id: Option<String> },
}

impl RoundState {
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Envelope id already processed.
    Duplicate,
    /// Nothing to change (liveness, inert or unknown-target events).
    Ignored,
    /// Live state changed.
    Updated,
    /// A message was appended to history.
    MessageAppended,
}

/// Read-only snapshot handed to the rendering layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtChainView {
    pub loading: bool,
    pub round: RoundState,
    pub steps: Vec<Step>,
    pub history: Vec<ChatMessage>,
}

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub description_mode: DescriptionMode,
    pub separator: String,
    pub code_roles: Vec<String>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for AggregatorSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            description_mode: config.description_mode,
            separator: config.description_separator.clone(),
            code_roles: config.code_roles.clone(),
        }
    }
}

/// Per-session round/step state machine.
#[derive(Debug, Clone)]
pub struct Aggregator {
    state: RoundState,
    steps: Vec<Step>,
    history: Vec<ChatMessage>,
    pending_files: Vec<GeneratedFile>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    mode: DescriptionMode,
    separator: String,
    classifier: ErrorClassifier,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorSettings::default())
    }
}

impl Aggregator {
    #[must_use]
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            state: RoundState::Idle,
            steps: Vec::new(),
            history: Vec::new(),
            pending_files: Vec::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            mode: settings.description_mode,
            separator: settings.separator,
            classifier: ErrorClassifier::new(settings.code_roles),
        }
    }

    #[must_use]
    pub const fn round_state(&self) -> &RoundState {
        &self.state
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    /// Live steps of the current round, in arrival order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn step(&self, post_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == post_id)
    }

    /// Finalized messages.
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    #[must_use]
    pub const fn description_mode(&self) -> DescriptionMode {
        self.mode
    }

    #[must_use]
    pub fn snapshot(&self) -> ThoughtChainView {
        ThoughtChainView {
            loading: self.is_loading(),
            round: self.state.clone(),
            steps: self.steps.clone(),
            history: self.history.clone(),
        }
    }

    /// Append a message originating outside the stream.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    /// Drop live round state, keeping history.
    pub fn reset_live(&mut self) {
        self.state = RoundState::Idle;
        self.steps.clear();
        self.pending_files.clear();
        self.seen.clear();
        self.seen_order.clear();
    }

    /// Drop everything, including history.
    pub fn reset(&mut self) {
        self.reset_live();
        self.history.clear();
    }

    /// Round state after `event`, given the current state.
    #[must_use]
    pub fn next_state(&self, event: &StreamEvent) -> RoundState {
        use RoundState::{Closed, Idle, Open};

        match (&self.state, event) {
            (_, StreamEvent::RoundStart { round_id }) => Open {
                round_id: round_id.clone(),
            },
            (Open { round_id }, StreamEvent::RoundEnd { .. }) => Closed {
                round_id: round_id.clone(),
            },
            (Idle, StreamEvent::RoundEnd { round_id }) => Closed {
                round_id: round_id.clone(),
            },
            (_, StreamEvent::ChatCompleted { .. } | StreamEvent::RoundError { .. }) => Idle,
            // Stream resumed mid-round after a reconnect.
            (Idle, StreamEvent::PostStart { .. }) => Open { round_id: None },
            (state, _) => state.clone(),
        }
    }

    /// Apply one event. `envelope_id` suppresses replays.
    pub fn apply(&mut self, envelope_id: &str, event: StreamEvent) -> Applied {
        if !self.remember(envelope_id) {
            tracing::debug!(envelope_id, "duplicate envelope skipped");
            return Applied::Duplicate;
        }

        let next = self.next_state(&event);
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, "round transition");
        }
        self.state = next;

        match event {
            StreamEvent::RoundStart { .. } => {
                self.steps.clear();
                self.pending_files.clear();
                Applied::Updated
            }
            StreamEvent::RoundEnd { .. } => Applied::Updated,
            StreamEvent::PostStart {
                post_id,
                role,
                title,
            } => {
                if self.step(&post_id).is_some() {
                    return Applied::Ignored;
                }
                self.steps.push(Step::new(post_id, role, title));
                Applied::Updated
            }
            StreamEvent::PostStatusUpdate { post_id, status } => {
                // Informational only; description is driven by attachments.
                tracing::trace!(post_id, status, "post status");
                Applied::Ignored
            }
            StreamEvent::PostSendToUpdate { post_id, send_to } => {
                self.update_step(&post_id, |step, _, _| {
                    if step.send_to.as_deref() == Some(send_to.as_str()) {
                        return false;
                    }
                    step.send_to = Some(send_to);
                    true
                })
            }
            StreamEvent::PostAttachmentUpdate {
                post_id,
                attachment,
            } => self.update_step(&post_id, |step, mode, separator| {
                let fields = attachment.clone();
                match step.merge_attachment(attachment) {
                    MergeOutcome::Unchanged => false,
                    MergeOutcome::Appended | MergeOutcome::Replaced => {
                        step.apply_attachment_fields(&fields, mode, separator);
                        true
                    }
                }
            }),
            StreamEvent::PostMessageUpdate {
                post_id,
                content,
                is_complete,
            } => {
                if !is_complete {
                    return Applied::Ignored;
                }
                self.update_step(&post_id, |step, _, _| {
                    step.content = content;
                    step.status = StepStatus::Finish;
                    true
                })
            }
            StreamEvent::PostEnd {
                post_id,
                final_message,
            } => self.update_step(&post_id, |step, _, _| {
                step.status = StepStatus::Finish;
                if let Some(message) = final_message {
                    step.content = message;
                }
                true
            }),
            StreamEvent::PostError { post_id, error } => {
                self.update_step(&post_id, |step, _, _| {
                    step.status = StepStatus::Error;
                    step.content = error;
                    true
                })
            }
            StreamEvent::ChatCompleted { response, files } => {
                let steps = std::mem::take(&mut self.steps);
                let mut all_files = std::mem::take(&mut self.pending_files);
                for file in files {
                    if !all_files.iter().any(|f| f.path == file.path) {
                        all_files.push(file);
                    }
                }
                tracing::info!(steps = steps.len(), files = all_files.len(), "round finalized");
                self.history
                    .push(ChatMessage::assistant(response, steps, all_files));
                Applied::MessageAppended
            }
            StreamEvent::RoundError { error } => {
                self.steps.clear();
                self.pending_files.clear();
                tracing::warn!(error, "round failed");
                self.history.push(ChatMessage::assistant_error(error));
                Applied::MessageAppended
            }
            StreamEvent::FileGenerated(file) => {
                if self.pending_files.iter().any(|f| f.path == file.path) {
                    return Applied::Ignored;
                }
                self.pending_files.push(file);
                Applied::Updated
            }
            StreamEvent::Shutdown { .. } | StreamEvent::Liveness => Applied::Ignored,
        }
    }

    fn update_step<F>(&mut self, post_id: &str, f: F) -> Applied
    where
        F: FnOnce(&mut Step, DescriptionMode, &str) -> bool,
    {
        let Some(step) = self.steps.iter_mut().find(|s| s.id == post_id) else {
            tracing::warn!(post_id, "event for unknown step ignored");
            return Applied::Ignored;
        };
        if !f(step, self.mode, &self.separator) {
            return Applied::Ignored;
        }
        step.display_status = self.classifier.display_status(step);
        Applied::Updated
    }

    /// Returns `false` if `envelope_id` was already seen.
    fn remember(&mut self, envelope_id: &str) -> bool {
        if self.seen.contains(envelope_id) {
            return false;
        }
        if self.seen_order.len() >= SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(envelope_id.to_string());
        self.seen_order.push_back(envelope_id.to_string());
        true
    }
}
