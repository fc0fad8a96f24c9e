//! Session-scoped stream connection with bounded reconnects.
//!
//! One background task per connection opens the transport under a timeout,
//! forwards frames and, on failure, sleeps `base * 2^attempt` before trying
//! again. Every `connect` or `teardown` bumps an epoch; a task whose epoch is
//! stale can no longer touch the shared state, so late results from a
//! superseded connection are dropped.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use serde::Serialize;
use thought_chain_core::{
    ConnectionConfig, ConnectionStatus, Frame, InvalidationReason, SessionId, Signal, SignalHub,
    StreamTransport, TransportError,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Buffered frames between the connection task and the consumer.
const FRAME_BUFFER: usize = 256;

/// Observable connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts since the transport was last open.
    pub retry_count: u32,
    /// A backoff timer is running.
    pub retry_pending: bool,
    pub session_id: Option<SessionId>,
}

impl ConnectionState {
    /// No connection is open and none will be without a new `connect`.
    #[must_use]
    pub fn gave_up(&self) -> bool {
        match self.status {
            ConnectionStatus::Disconnected => true,
            ConnectionStatus::Error => !self.retry_pending,
            ConnectionStatus::Connecting | ConnectionStatus::Connected => false,
        }
    }
}

/// A frame tagged with the session it was received for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFrame {
    pub session_id: SessionId,
    pub frame: Frame,
}

struct Shared {
    epoch: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Apply `f` only while `epoch` is current. Returns whether it applied.
    fn update(&self, epoch: u64, f: impl FnOnce(&mut ConnectionState)) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            f(state);
            applied = true;
            true
        });
        applied
    }

    /// Start a new epoch and reset the state under the same lock.
    fn advance(&self, next: ConnectionState) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|state| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = next;
        });
        epoch
    }
}

/// Owns at most one live connection.
pub struct ConnectionManager<T: StreamTransport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    signals: Arc<SignalHub>,
    frames: mpsc::Sender<SessionFrame>,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl<T: StreamTransport> ConnectionManager<T> {
    /// Create a manager and the receiver its frames are delivered to.
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        config: ConnectionConfig,
        signals: Arc<SignalHub>,
    ) -> (Self, mpsc::Receiver<SessionFrame>) {
        let (frames, rx) = mpsc::channel(FRAME_BUFFER);
        let (state, _) = watch::channel(ConnectionState::default());
        let manager = Self {
            transport,
            config,
            signals,
            frames,
            shared: Arc::new(Shared {
                epoch: AtomicU64::new(0),
                state,
            }),
            task: None,
        };
        (manager, rx)
    }

    /// Connect to `session_id`, replacing any existing connection.
    pub fn connect(&mut self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        self.abort_task();

        let epoch = self.shared.advance(ConnectionState {
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            retry_pending: false,
            session_id: Some(session_id.clone()),
        });
        tracing::info!(%session_id, epoch, "connecting");

        let worker = Worker {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            signals: Arc::clone(&self.signals),
            frames: self.frames.clone(),
            shared: Arc::clone(&self.shared),
            epoch,
            session_id,
        };
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Reconnect to the current session with a fresh retry budget.
    ///
    /// Returns `false` if there is no session to reconnect to.
    pub fn reconnect(&mut self) -> bool {
        match self.session_id() {
            Some(id) => {
                self.connect(id);
                true
            }
            None => false,
        }
    }

    /// Close the connection and cancel any pending retry. Idempotent.
    pub fn teardown(&mut self) {
        let was_active = self.task.is_some();
        self.abort_task();
        self.shared.advance(ConnectionState::default());
        if was_active {
            tracing::info!("connection torn down");
        }
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.borrow().status
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.shared.state.borrow().retry_count
    }

    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.shared.state.borrow().retry_pending
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.state.borrow().session_id.clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl<T: StreamTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.abort_task();
    }
}

struct Worker<T> {
    transport: Arc<T>,
    config: ConnectionConfig,
    signals: Arc<SignalHub>,
    frames: mpsc::Sender<SessionFrame>,
    shared: Arc<Shared>,
    epoch: u64,
    session_id: SessionId,
}

/// How one open-and-forward cycle ended.
enum Ended {
    /// Consumer went away or the connection was superseded.
    Detached,
    /// Failed before the transport opened.
    NotOpened(TransportError),
    /// Failed after the transport opened.
    Dropped(TransportError),
}

impl<T: StreamTransport> Worker<T> {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.cycle().await {
                Ended::Detached => return,
                Ended::NotOpened(error) => error,
                Ended::Dropped(error) => {
                    attempt = 0;
                    error
                }
            };
            // `Error` with no pending retry is final.
            let retrying = error.is_retryable() && attempt < self.config.max_retries;
            let delay = self.config.retry_delay(attempt);
            if retrying {
                attempt += 1;
            }
            if !self.shared.update(self.epoch, |s| {
                s.status = ConnectionStatus::Error;
                s.retry_pending = retrying;
                if retrying {
                    s.retry_count = attempt;
                }
            }) {
                return;
            }

            if !error.is_retryable() {
                self.reject(&error);
                return;
            }
            if !retrying {
                tracing::error!(
                    session_id = %self.session_id,
                    attempts = attempt,
                    %error,
                    "reconnect attempts exhausted"
                );
                self.signals.push(Signal::ConnectionExhausted {
                    session_id: self.session_id.clone(),
                    attempts: attempt,
                });
                return;
            }

            tracing::warn!(
                session_id = %self.session_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "stream failed, retrying"
            );

            tokio::time::sleep(delay).await;

            if !self.shared.update(self.epoch, |s| {
                s.retry_pending = false;
                s.status = ConnectionStatus::Connecting;
            }) {
                return;
            }
        }
    }

    async fn cycle(&self) -> Ended {
        let opened = tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.open(&self.session_id),
        )
        .await;

        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Ended::NotOpened(e),
            Err(_) => return Ended::NotOpened(TransportError::Timeout),
        };

        if !self.shared.update(self.epoch, |s| {
            s.status = ConnectionStatus::Connected;
            s.retry_count = 0;
            s.retry_pending = false;
        }) {
            return Ended::Detached;
        }
        tracing::info!(session_id = %self.session_id, "stream open");

        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => {
                    let tagged = SessionFrame {
                        session_id: self.session_id.clone(),
                        frame,
                    };
                    if self.frames.send(tagged).await.is_err() {
                        return Ended::Detached;
                    }
                }
                Err(e) => return Ended::Dropped(e),
            }
        }
        Ended::Dropped(TransportError::Stream("stream closed by server".into()))
    }

    fn reject(&self, error: &TransportError) {
        tracing::warn!(session_id = %self.session_id, %error, "stream rejected");
        match error {
            TransportError::AuthExpired(status) => {
                self.signals.push(Signal::AuthExpired {
                    session_id: self.session_id.clone(),
                    status: *status,
                });
            }
            TransportError::NotFound => {
                self.signals.push(Signal::SessionInvalidated {
                    session_id: Some(self.session_id.clone()),
                    reason: InvalidationReason::NotFound,
                });
            }
            _ => {}
        }
    }
}
