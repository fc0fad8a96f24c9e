//! Core building blocks for consuming an agent's streamed reasoning turn.
//!
//! This crate provides:
//! - `Envelope` / `StreamEvent` - the closed wire taxonomy and typed payloads
//! - `Dispatcher` - raw frame parsing and routing
//! - `Aggregator` - the round/step state machine producing the thought chain
//! - `SignalHub` - broadcast + history of non-fatal client signals
//! - `ComposerContext` - transient state staged before a submission
//! - `SessionApi` / `StreamTransport` seam traits

pub mod aggregator;
pub mod classify;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod message;
pub mod signal_hub;
pub mod step;
pub mod traits;

pub use aggregator::{Aggregator, AggregatorSettings, Applied, RoundState, ThoughtChainView};
pub use config::{ClientConfig, ConfigError, ConnectionConfig, DescriptionMode, HeaderConfig};
pub use context::{ChatRequest, ComposeError, ComposerContext, UploadedFile};
pub use dispatcher::{Dispatcher, Routed};
pub use envelope::{Envelope, EnvelopeKind, Frame, ParseError, StreamEvent};
pub use message::{ChatMessage, ChatRole, GeneratedFile};
pub use signal_hub::{InvalidationReason, Signal, SignalHub};
pub use step::{Attachment, AttachmentKind, Step, StepStatus};
pub use traits::{
    ApiError, ConnectionStatus, FrameStream, Session, SessionApi, SessionId, StreamTransport,
    TransportError,
};
