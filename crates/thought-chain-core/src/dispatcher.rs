//! Frame routing.
//!
//! Turns raw frames into envelopes, feeds typed events to the aggregator and
//! raises signals for everything the application should hear about. A bad
//! frame never stops the stream.

use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    Aggregator, Applied, Envelope, EnvelopeKind, Frame, Signal, SignalHub, StreamEvent,
    envelope::ParseError,
};

/// Result of routing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub envelope: Envelope,
    pub applied: Applied,
}

pub struct Dispatcher {
    signals: Arc<SignalHub>,
    last_seen: Option<Instant>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(signals: Arc<SignalHub>) -> Self {
        Self {
            signals,
            last_seen: None,
        }
    }

    /// When the last well-formed envelope arrived.
    #[must_use]
    pub const fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Parse a frame into an envelope and its typed event.
    ///
    /// # Errors
    /// Returns error if the frame is not a JSON object or a known event
    /// lacks required fields.
    pub fn parse(frame: &Frame) -> Result<(Envelope, StreamEvent), ParseError> {
        let envelope = Envelope::parse(frame)?;
        let event = StreamEvent::from_envelope(&envelope)?;
        Ok((envelope, event))
    }

    /// Route one frame. Returns `None` for frames that failed to parse.
    pub fn on_frame(&mut self, frame: &Frame, aggregator: &mut Aggregator) -> Option<Routed> {
        let (envelope, event) = match Self::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(event = e.event(), error = %e, "dropping malformed frame");
                self.signals.push(Signal::ParseError {
                    event: e.event().to_string(),
                    message: e.to_string(),
                });
                return None;
            }
        };
        self.last_seen = Some(Instant::now());

        tracing::trace!(id = %envelope.id, kind = envelope.kind.as_str(), "envelope");
        if envelope.kind == EnvelopeKind::Generic {
            tracing::debug!(wire_type = %envelope.wire_type, "unrecognized event type");
        }

        let notice = Self::notice(&event);
        let applied = aggregator.apply(&envelope.id, event);
        if applied != Applied::Duplicate {
            if let Some(signal) = notice {
                self.signals.push(signal);
            }
        }

        Some(Routed { envelope, applied })
    }

    fn notice(event: &StreamEvent) -> Option<Signal> {
        match event {
            StreamEvent::PostError { post_id, error } => Some(Signal::ProtocolError {
                post_id: Some(post_id.clone()),
                message: error.clone(),
            }),
            StreamEvent::RoundError { error } => Some(Signal::ProtocolError {
                post_id: None,
                message: error.clone(),
            }),
            StreamEvent::Shutdown { message } => Some(Signal::ServerShutdown {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn setup() -> (Dispatcher, Aggregator, Arc<SignalHub>) {
        let hub = Arc::new(SignalHub::default());
        (Dispatcher::new(hub.clone()), Aggregator::default(), hub)
    }

    #[test]
    fn test_malformed_frame_raises_signal_and_continues() {
        let (mut dispatcher, mut agg, hub) = setup();

        assert!(dispatcher.on_frame(&Frame::new("post_start", "{not json"), &mut agg).is_none());
        assert!(dispatcher.last_seen().is_none());
        assert!(matches!(
            hub.get_history().as_slice(),
            [Signal::ParseError { event, .. }] if event == "post_start"
        ));

        let ok = Frame::new("post_start", json!({"post_id": "p1", "role": "Planner"}).to_string());
        let routed = dispatcher.on_frame(&ok, &mut agg).unwrap();
        assert_eq!(routed.applied, Applied::Updated);
        assert_eq!(agg.steps().len(), 1);
        assert!(dispatcher.last_seen().is_some());
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let (mut dispatcher, mut agg, hub) = setup();
        let frame = Frame::new("post_attachment_update", json!({"post_id": "p1"}).to_string());
        assert!(dispatcher.on_frame(&frame, &mut agg).is_none());
        assert_eq!(hub.get_history().len(), 1);
    }

    #[test]
    fn test_errors_and_shutdown_are_signalled() {
        let (mut dispatcher, mut agg, hub) = setup();
        let frames = [
            Frame::new("post_start", json!({"post_id": "p1"}).to_string()).with_id("1"),
            Frame::new("post_error", json!({"post_id": "p1", "error": "boom"}).to_string())
                .with_id("2"),
            Frame::new("error", json!({"message": "agent crashed"}).to_string()).with_id("3"),
            Frame::new("shutdown", json!({"message": "bye"}).to_string()).with_id("4"),
        ];
        for frame in &frames {
            dispatcher.on_frame(frame, &mut agg);
        }
        // Replayed envelope does not signal twice.
        dispatcher.on_frame(&frames[3], &mut agg);

        assert_eq!(
            hub.get_history(),
            vec![
                Signal::ProtocolError {
                    post_id: Some("p1".into()),
                    message: "boom".into(),
                },
                Signal::ProtocolError {
                    post_id: None,
                    message: "agent crashed".into(),
                },
                Signal::ServerShutdown {
                    message: "bye".into(),
                },
            ]
        );
        assert!(agg.history().last().unwrap().is_error());
    }

    #[test]
    fn test_unknown_type_counts_as_liveness() {
        let (mut dispatcher, mut agg, hub) = setup();
        let routed = dispatcher
            .on_frame(&Frame::new("progress_tick", "{}"), &mut agg)
            .unwrap();
        assert_eq!(routed.envelope.kind, EnvelopeKind::Generic);
        assert_eq!(routed.applied, Applied::Ignored);
        assert!(dispatcher.last_seen().is_some());
        assert!(hub.get_history().is_empty());
    }
}
