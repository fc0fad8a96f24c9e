//! Broadcast + history hub for client-level signals.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionId;

/// Why a session was dropped locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// Server no longer knows the session (404).
    NotFound,
    /// Credentials rejected (401/403).
    AuthExpired,
    /// Caller asked for it.
    Requested,
}

/// Non-fatal event the application should react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    SessionCreated {
        session_id: SessionId,
    },
    SessionInvalidated {
        session_id: Option<SessionId>,
        reason: InvalidationReason,
    },
    /// Credentials rejected while talking to `session_id`.
    AuthExpired {
        session_id: SessionId,
        status: u16,
    },
    /// Malformed frame; the stream continues.
    ParseError {
        event: String,
        message: String,
    },
    /// Step- or round-level failure reported by the server.
    ProtocolError {
        post_id: Option<String>,
        message: String,
    },
    /// Automatic reconnects used up.
    ConnectionExhausted {
        session_id: SessionId,
        attempts: u32,
    },
    ServerShutdown {
        message: String,
    },
}

struct Inner {
    history: VecDeque<Signal>,
    capacity: usize,
}

/// Signal hub with broadcast and bounded history.
///
/// Late subscribers replay recent history and then follow live signals.
pub struct SignalHub {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Signal>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalHub {
    /// Create a hub retaining at most `capacity` signals.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(capacity.min(32)),
                capacity,
            }),
            sender,
        }
    }

    /// Publish to live listeners and history.
    pub fn push(&self, signal: Signal) {
        tracing::debug!(?signal, "signal");
        let _ = self.sender.send(signal.clone()); // live listeners

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.capacity == 0 {
            return;
        }
        while inner.history.len() >= inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(signal);
    }

    /// Get a receiver for live signals.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<Signal> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clear();
    }

    /// Stream that yields history first, then live signals.
    ///
    /// Lagged live signals are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, Signal> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
