//! In-memory stand-ins for the network seams.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use thought_chain_core::{
    ApiError, ChatRequest, Frame, FrameStream, Session, SessionApi, StreamTransport,
    TransportError,
};
use tokio::sync::mpsc;

/// Session API that records calls and returns configured results.
#[derive(Default)]
pub struct FakeApi {
    created: AtomicUsize,
    calls: Mutex<Vec<String>>,
    pub heartbeat_result: Mutex<Option<ApiError>>,
    pub delete_result: Mutex<Option<ApiError>>,
    pub submit_result: Mutex<Option<ApiError>>,
    pub submitted: Mutex<Vec<ChatRequest>>,
}

impl FakeApi {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn fail_heartbeat(&self, error: ApiError) {
        *self.heartbeat_result.lock().unwrap() = Some(error);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn result(slot: &Mutex<Option<ApiError>>) -> Result<(), ApiError> {
        slot.lock().unwrap().clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn create_session(&self) -> Result<Session, ApiError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("create".into());
        Ok(Session {
            id: format!("s{n}"),
            conversation_id: None,
            created_at: Utc::now(),
        })
    }

    async fn delete_session(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("delete:{id}"));
        Self::result(&self.delete_result)
    }

    async fn heartbeat(&self, id: &str) -> Result<(), ApiError> {
        self.record(format!("heartbeat:{id}"));
        Self::result(&self.heartbeat_result)
    }

    async fn submit_message(&self, id: &str, request: &ChatRequest) -> Result<(), ApiError> {
        self.record(format!("submit:{id}"));
        self.submitted.lock().unwrap().push(request.clone());
        Self::result(&self.submit_result)
    }
}

/// Transport whose streams are fed by the test.
#[derive(Default)]
pub struct FakeTransport {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Result<Frame, TransportError>>>>,
    pub refusal: Mutex<Option<TransportError>>,
}

impl FakeTransport {
    pub fn is_open(&self, session_id: &str) -> bool {
        self.senders.lock().unwrap().contains_key(session_id)
    }

    pub async fn wait_open(&self, session_id: &str) {
        while !self.is_open(session_id) {
            tokio::task::yield_now().await;
        }
    }

    pub fn send(&self, session_id: &str, frame: Frame) {
        if let Some(tx) = self.senders.lock().unwrap().get(session_id) {
            let _ = tx.send(Ok(frame));
        }
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn open(&self, session_id: &str) -> Result<FrameStream, TransportError> {
        if let Some(error) = self.refusal.lock().unwrap().clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap()
            .insert(session_id.to_string(), tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}
