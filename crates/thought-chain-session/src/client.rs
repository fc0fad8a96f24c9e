//! Client facade.
//!
//! `ChatClient` owns one session lifecycle, one stream connection and the
//! aggregator fed by it. All protocol state is driven from a single task
//! through [`ChatClient::pump`]; the rendering side reads snapshots from a
//! watch channel.

use std::sync::Arc;

use futures::stream::BoxStream;
use thought_chain_core::{
    Aggregator, AggregatorSettings, ChatMessage, ClientConfig, ComposeError, ConnectionStatus,
    Dispatcher, InvalidationReason, Session, SessionApi, SessionId, Signal, SignalHub,
    StreamTransport, ThoughtChainView, UploadedFile,
};
use thought_chain_transport::{
    ConnectionManager, ConnectionState, HttpSessionApi, SessionFrame, SseTransport,
    http::HeaderError,
};
use tokio::sync::{
    broadcast::{
        self,
        error::{RecvError, TryRecvError},
    },
    mpsc, watch,
};

use crate::manager::{LifecycleError, SessionLifecycle};

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("Invalid message: {0}")]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("Stream not connected ({0:?})")]
    NotConnected(ConnectionStatus),
}

enum Incoming {
    Frame(Option<SessionFrame>),
    Signal(Result<Signal, RecvError>),
}

/// Streaming chat client for one user.
pub struct ChatClient<A: SessionApi + 'static, T: StreamTransport> {
    lifecycle: SessionLifecycle<A>,
    connection: ConnectionManager<T>,
    frames: mpsc::Receiver<SessionFrame>,
    signals: Arc<SignalHub>,
    signal_rx: broadcast::Receiver<Signal>,
    dispatcher: Dispatcher,
    aggregator: Aggregator,
    view: watch::Sender<ThoughtChainView>,
}

impl ChatClient<HttpSessionApi, SseTransport> {
    /// Client speaking HTTP and server-sent events to `config.base_url`.
    ///
    /// # Errors
    /// Returns error if an auth header is invalid.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let api = Arc::new(HttpSessionApi::new(config)?);
        let transport = Arc::new(SseTransport::new(config)?);
        Ok(Self::new(config, api, transport))
    }
}

impl<A: SessionApi + 'static, T: StreamTransport> ChatClient<A, T> {
    #[must_use]
    pub fn new(config: &ClientConfig, api: Arc<A>, transport: Arc<T>) -> Self {
        let signals = Arc::new(SignalHub::new(config.signal_history));
        let signal_rx = signals.get_receiver();
        let lifecycle =
            SessionLifecycle::new(api, Arc::clone(&signals), config.heartbeat_interval());
        let (connection, frames) =
            ConnectionManager::new(transport, config.connection.clone(), Arc::clone(&signals));
        let aggregator = Aggregator::new(AggregatorSettings::from(config));
        let (view, _) = watch::channel(aggregator.snapshot());

        Self {
            lifecycle,
            connection,
            frames,
            dispatcher: Dispatcher::new(Arc::clone(&signals)),
            signals,
            signal_rx,
            aggregator,
            view,
        }
    }

    /// Start over with a fresh server session and an empty conversation.
    ///
    /// # Errors
    /// Returns error if the session cannot be created.
    pub async fn start_new_session(&mut self) -> Result<Session, ClientError> {
        self.connection.teardown();
        self.aggregator.reset();
        self.publish();

        let session = self.lifecycle.start_new_session().await?;
        self.connection.connect(session.id.clone());
        Ok(session)
    }

    /// Delete the session and disconnect.
    ///
    /// # Errors
    /// Returns error if the server refuses the delete.
    pub async fn end_session(&mut self) -> Result<(), ClientError> {
        self.connection.teardown();
        self.aggregator.reset_live();
        self.publish();
        self.lifecycle.end_session().await?;
        Ok(())
    }

    /// Validate the session, then submit `content` with the staged context.
    ///
    /// The user message is recorded before the call; a failed call appends
    /// an error reply so history stays consistent.
    ///
    /// # Errors
    /// Returns error if the session is gone, the content is invalid or the
    /// server rejects the submission.
    pub async fn submit(&mut self, content: &str) -> Result<(), ClientError> {
        if let Err(e) = self.lifecycle.ensure_valid().await {
            if matches!(e, LifecycleError::Invalidated(_) | LifecycleError::NoSession) {
                self.drop_session_state();
            }
            return Err(e.into());
        }

        let request = self
            .lifecycle
            .with_context(|ctx| ctx.take_request(content))
            .await?;
        self.aggregator.push_message(ChatMessage::user(
            request.content.clone(),
            request.uploaded_files.clone(),
        ));
        self.publish();

        if let Err(e) = self.lifecycle.submit(&request).await {
            tracing::warn!(error = %e, "submission failed");
            if !matches!(e, LifecycleError::Invalidated(_)) {
                self.lifecycle
                    .with_context(|ctx| ctx.restage(request))
                    .await;
            }
            self.aggregator
                .push_message(ChatMessage::assistant_error(e.to_string()));
            self.publish();
            return Err(e.into());
        }
        Ok(())
    }

    /// Probe the session now.
    pub async fn check_session_validity(&self) -> bool {
        self.lifecycle.check_session_validity().await
    }

    pub async fn select_data_source(&self, id: impl Into<String>) {
        let id = id.into();
        self.lifecycle
            .with_context(|ctx| ctx.select_data_source(id))
            .await;
    }

    pub async fn stage_upload(&self, file: UploadedFile) {
        self.lifecycle.with_context(|ctx| ctx.stage_upload(file)).await;
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.lifecycle
            .with_context(|ctx| ctx.set_metadata(key, value))
            .await;
    }

    /// Wait until the stream of the current session is open.
    ///
    /// Events sent before the stream attaches are not replayed by the
    /// server, so submit only after this returns.
    ///
    /// # Errors
    /// Returns `NotConnected` once the connection gives up or is torn down.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut state = self.connection.subscribe();
        let status = state
            .wait_for(|s| s.status == ConnectionStatus::Connected || s.gave_up())
            .await
            .map_or(ConnectionStatus::Disconnected, |s| s.status);
        if status == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected(status))
        }
    }

    /// Manually reconnect the stream with a fresh retry budget.
    pub fn reconnect(&mut self) -> bool {
        self.connection.reconnect()
    }

    /// Disconnect and delete the session.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.end_session().await {
            tracing::warn!(error = %e, "failed to end session on shutdown");
        }
    }

    /// Wait for the next frame or signal and apply it.
    ///
    /// Returns `false` once the inputs are closed.
    pub async fn pump(&mut self) -> bool {
        let incoming = tokio::select! {
            frame = self.frames.recv() => Incoming::Frame(frame),
            signal = self.signal_rx.recv() => Incoming::Signal(signal),
        };
        match incoming {
            Incoming::Frame(Some(frame)) => self.on_frame(&frame).await,
            Incoming::Signal(Ok(signal)) => self.on_signal(&signal).await,
            Incoming::Signal(Err(RecvError::Lagged(n))) => {
                tracing::warn!(skipped = n, "signal receiver lagged");
            }
            Incoming::Frame(None) | Incoming::Signal(Err(RecvError::Closed)) => return false,
        }
        true
    }

    /// Apply everything already queued without waiting. Returns the count.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.signal_rx.try_recv() {
                Ok(signal) => {
                    self.on_signal(&signal).await;
                    handled += 1;
                    continue;
                }
                Err(TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "signal receiver lagged");
                    continue;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => {}
            }
            match self.frames.try_recv() {
                Ok(frame) => {
                    self.on_frame(&frame).await;
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Pump until the inputs close.
    pub async fn run(&mut self) {
        while self.pump().await {}
    }

    async fn on_frame(&mut self, incoming: &SessionFrame) {
        if self.lifecycle.session_id().await.as_deref() != Some(incoming.session_id.as_str()) {
            tracing::debug!(session_id = %incoming.session_id, "frame for superseded session dropped");
            return;
        }
        if self
            .dispatcher
            .on_frame(&incoming.frame, &mut self.aggregator)
            .is_some()
        {
            self.publish();
        }
    }

    async fn on_signal(&mut self, signal: &Signal) {
        let (target, reason) = match signal {
            Signal::SessionInvalidated { session_id, reason } => (session_id.as_deref(), *reason),
            Signal::AuthExpired { session_id, .. } => {
                (Some(session_id.as_str()), InvalidationReason::AuthExpired)
            }
            _ => return,
        };

        let current = self.lifecycle.session_id().await;
        if matches!((current.as_deref(), target), (Some(c), Some(t)) if c != t) {
            tracing::debug!(session_id = ?target, ?current, "signal for superseded session ignored");
            return;
        }
        match target {
            Some(id) => self.lifecycle.invalidate_if(id, reason).await,
            None => self.lifecycle.invalidate(reason).await,
        };
        self.drop_session_state();
    }

    fn drop_session_state(&mut self) {
        self.connection.teardown();
        self.aggregator.reset_live();
        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(self.aggregator.snapshot());
    }

    /// Current snapshot.
    #[must_use]
    pub fn view(&self) -> ThoughtChainView {
        self.view.borrow().clone()
    }

    /// Snapshot updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ThoughtChainView> {
        self.view.subscribe()
    }

    /// Recent signals followed by live ones.
    #[must_use]
    pub fn signals(&self) -> BoxStream<'static, Signal> {
        self.signals.history_plus_stream()
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.lifecycle.session_id().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use thought_chain_core::{ChatRole, DescriptionMode, Frame, StepStatus};

    use super::*;
    use crate::fakes::{FakeApi, FakeTransport};

    type Client = ChatClient<FakeApi, FakeTransport>;

    fn client(mode: DescriptionMode) -> (Client, Arc<FakeApi>, Arc<FakeTransport>) {
        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(FakeTransport::default());
        let config = ClientConfig::default().with_description_mode(mode);
        (
            ChatClient::new(&config, Arc::clone(&api), Arc::clone(&transport)),
            api,
            transport,
        )
    }

    fn frame(id: &str, event: &str, data: &serde_json::Value) -> Frame {
        Frame::new(event, data.to_string()).with_id(id)
    }

    async fn pump_until(client: &mut Client, done: impl Fn(&ThoughtChainView) -> bool) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            while !done(&client.view()) {
                assert!(client.pump().await);
            }
        })
        .await
        .expect("condition not reached");
    }

    fn attachment(id: &str, content: &str) -> serde_json::Value {
        json!({
            "post_id": "p1",
            "attachment": {"id": "a1", "type": "thought", "content": content, "is_complete": true},
            "session_id": id,
        })
    }

    #[tokio::test]
    async fn test_round_streams_into_history() {
        let (mut client, _api, transport) = client(DescriptionMode::Replace);
        let session = client.start_new_session().await.unwrap();
        transport.wait_open(&session.id).await;

        let script = [
            frame("1", "round_start", &json!({"round_id": "r1"})),
            frame("2", "post_start", &json!({"post_id": "p1", "role": "Planner"})),
            frame("3", "post_attachment_update", &attachment("s1", "X")),
            frame("4", "post_attachment_update", &attachment("s1", "Y")),
            frame("5", "post_end", &json!({"post_id": "p1"})),
            frame("6", "round_end", &json!({"round_id": "r1"})),
            frame("7", "chat_completed", &json!({"response": "done", "files": []})),
        ];
        for f in script {
            transport.send(&session.id, f);
        }

        pump_until(&mut client, |view| !view.history.is_empty()).await;
        let view = client.view();
        assert!(!view.loading);
        assert!(view.steps.is_empty());
        assert_eq!(view.history.len(), 1);

        let message = &view.history[0];
        assert_eq!(message.role(), ChatRole::Assistant);
        assert_eq!(message.steps().len(), 1);
        assert_eq!(message.steps()[0].description, "Y");
        assert_eq!(message.steps()[0].status, StepStatus::Finish);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_not_found_clears_live_state() {
        let (mut client, api, transport) = client(DescriptionMode::Replace);
        let session = client.start_new_session().await.unwrap();
        transport.wait_open(&session.id).await;
        api.fail_heartbeat(thought_chain_core::ApiError::NotFound);

        transport.send(&session.id, frame("1", "round_start", &json!({})));
        transport.send(
            &session.id,
            frame("2", "post_start", &json!({"post_id": "p1", "role": "Planner"})),
        );
        pump_until(&mut client, |view| view.steps.len() == 1).await;

        // Idle until the heartbeat fires and the invalidation is applied.
        pump_until(&mut client, |view| view.steps.is_empty()).await;

        assert_eq!(client.session_id().await, None);
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert!(!client.view().loading);

        let probes = api.count("heartbeat");
        assert_eq!(probes, 1);
        assert!(!client.check_session_validity().await);
        assert_eq!(api.count("heartbeat"), probes);
    }

    #[tokio::test]
    async fn test_submit_records_user_message() {
        let (mut client, api, _transport) = client(DescriptionMode::Replace);
        client.start_new_session().await.unwrap();
        client.select_data_source("sales").await;

        client.submit("  show revenue  ").await.unwrap();

        let submitted = api.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].content, "show revenue");
        assert_eq!(submitted[0].selected_table.as_deref(), Some("sales"));

        let view = client.view();
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.history[0].role(), ChatRole::User);
        assert_eq!(view.history[0].text(), "show revenue");
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_and_missing_session() {
        let (mut client, api, _transport) = client(DescriptionMode::Replace);
        assert!(matches!(
            client.submit("hi").await,
            Err(ClientError::Lifecycle(LifecycleError::NoSession))
        ));
        assert!(api.calls().is_empty());

        client.start_new_session().await.unwrap();
        assert!(matches!(
            client.submit("   ").await,
            Err(ClientError::Compose(ComposeError::Empty))
        ));
        assert!(client.view().history.is_empty());
    }

    #[tokio::test]
    async fn test_failed_submission_appends_error_reply() {
        let (mut client, api, _transport) = client(DescriptionMode::Replace);
        client.start_new_session().await.unwrap();
        *api.submit_result.lock().unwrap() = Some(thought_chain_core::ApiError::Status {
            status: 500,
            body: "消息处理失败".into(),
        });

        assert!(client.submit("hello").await.is_err());
        let history = client.view().history;
        assert_eq!(history.len(), 2);
        assert!(history[1].is_error());
    }

    #[tokio::test]
    async fn test_failed_submission_keeps_staged_context() {
        let (mut client, api, _transport) = client(DescriptionMode::Replace);
        client.start_new_session().await.unwrap();
        client
            .stage_upload(UploadedFile {
                file_id: None,
                original_name: "q3.csv".into(),
                saved_name: "saved-q3.csv".into(),
                saved_path: "/uploads/saved-q3.csv".into(),
                size: None,
            })
            .await;
        client.set_metadata("template_id", json!("t1")).await;
        *api.submit_result.lock().unwrap() = Some(thought_chain_core::ApiError::Network(
            "connection reset".into(),
        ));

        assert!(client.submit("compare quarters").await.is_err());
        let (uploads, template) = client
            .lifecycle
            .with_context(|ctx| {
                (
                    ctx.staged_uploads.len(),
                    ctx.get_metadata("template_id").cloned(),
                )
            })
            .await;
        assert_eq!(uploads, 1);
        assert_eq!(template, Some(json!("t1")));

        *api.submit_result.lock().unwrap() = None;
        client.submit("compare quarters").await.unwrap();
        let submitted = api.submitted.lock().unwrap().clone();
        assert_eq!(submitted[1].uploaded_files.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_invalidation_spares_new_session() {
        let (mut client, api, transport) = client(DescriptionMode::Replace);
        let first = client.start_new_session().await.unwrap();
        transport.wait_open(&first.id).await;

        // The heartbeat drops s1 while nothing pumps the client.
        api.fail_heartbeat(thought_chain_core::ApiError::NotFound);
        tokio::time::sleep(Duration::from_secs(121)).await;
        while client.session_id().await.is_some() {
            tokio::task::yield_now().await;
        }
        *api.heartbeat_result.lock().unwrap() = None;

        let second = client.start_new_session().await.unwrap();
        client.wait_connected().await.unwrap();
        client.drain().await;

        assert_eq!(client.session_id().await, Some(second.id.clone()));
        assert_eq!(client.connection_status(), ConnectionStatus::Connected);

        transport.send(&second.id, frame("1", "post_start", &json!({"post_id": "p1"})));
        pump_until(&mut client, |view| view.steps.len() == 1).await;
    }

    #[tokio::test]
    async fn test_invalidation_for_current_session_applies() {
        let (mut client, _api, transport) = client(DescriptionMode::Replace);
        let session = client.start_new_session().await.unwrap();
        client.wait_connected().await.unwrap();
        transport.send(&session.id, frame("1", "post_start", &json!({"post_id": "p1"})));
        pump_until(&mut client, |view| view.steps.len() == 1).await;

        client
            .on_signal(&Signal::AuthExpired {
                session_id: "elsewhere".into(),
                status: 401,
            })
            .await;
        assert_eq!(client.session_id().await, Some(session.id.clone()));

        client
            .on_signal(&Signal::AuthExpired {
                session_id: session.id.clone(),
                status: 401,
            })
            .await;
        assert_eq!(client.session_id().await, None);
        assert!(client.view().steps.is_empty());
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_connected() {
        let (mut client, _api, transport) = client(DescriptionMode::Replace);
        assert!(matches!(
            client.wait_connected().await,
            Err(ClientError::NotConnected(ConnectionStatus::Disconnected))
        ));

        client.start_new_session().await.unwrap();
        tokio_test::assert_ok!(client.wait_connected().await);

        *transport.refusal.lock().unwrap() = Some(thought_chain_core::TransportError::NotFound);
        assert!(client.reconnect());
        assert!(matches!(
            client.wait_connected().await,
            Err(ClientError::NotConnected(ConnectionStatus::Error))
        ));
    }

    #[tokio::test]
    async fn test_new_session_resets_conversation() {
        let (mut client, api, transport) = client(DescriptionMode::Keep);
        let first = client.start_new_session().await.unwrap();
        transport.wait_open(&first.id).await;
        transport.send(&first.id, frame("1", "post_start", &json!({"post_id": "p1"})));
        pump_until(&mut client, |view| view.steps.len() == 1).await;

        let second = client.start_new_session().await.unwrap();
        assert_eq!(second.id, "s2");
        assert!(client.view().steps.is_empty());
        assert_eq!(api.count("delete:s1"), 1);

        transport.wait_open(&second.id).await;
        transport.send(&first.id, frame("2", "post_start", &json!({"post_id": "old"})));
        transport.send(&second.id, frame("3", "post_start", &json!({"post_id": "new"})));
        pump_until(&mut client, |view| view.steps.len() == 1).await;
        assert_eq!(client.view().steps[0].id, "new");
    }

    #[tokio::test]
    async fn test_drain_applies_queued_frames() {
        let (mut client, _api, transport) = client(DescriptionMode::Replace);
        let session = client.start_new_session().await.unwrap();
        transport.wait_open(&session.id).await;
        transport.send(&session.id, frame("1", "round_start", &json!({})));
        transport.send(&session.id, Frame::new("post_start", "{not json").with_id("2"));

        let mut handled = 0;
        while handled < 3 {
            tokio::task::yield_now().await;
            handled += client.drain().await;
        }
        assert!(client.view().loading);
    }
}
