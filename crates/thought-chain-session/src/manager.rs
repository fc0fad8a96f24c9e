//! Session lifecycle: creation, heartbeat and invalidation.

use std::{sync::Arc, time::Duration};

use thought_chain_core::{
    ApiError, ChatRequest, ComposerContext, InvalidationReason, Session, SessionApi, SessionId,
    Signal, SignalHub,
};
use tokio::{
    sync::RwLock,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

/// Session lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("No active session")]
    NoSession,
    #[error("Session invalidated ({0:?})")]
    Invalidated(InvalidationReason),
    #[error(transparent)]
    Api(#[from] ApiError),
}

const fn reason_for(error: &ApiError) -> InvalidationReason {
    match error {
        ApiError::AuthExpired(_) => InvalidationReason::AuthExpired,
        _ => InvalidationReason::NotFound,
    }
}

/// State bound to the current session.
#[derive(Default)]
struct Bound {
    session: Option<Session>,
    heartbeat: Option<JoinHandle<()>>,
    context: ComposerContext,
}

struct Core<A> {
    api: Arc<A>,
    signals: Arc<SignalHub>,
    bound: RwLock<Bound>,
}

impl<A: SessionApi + 'static> Core<A> {
    async fn session_id(&self) -> Option<SessionId> {
        self.bound.read().await.session.as_ref().map(|s| s.id.clone())
    }

    /// Heartbeat `id`; invalidates on not-found or auth rejection.
    async fn probe(&self, id: &str) -> Result<(), LifecycleError> {
        match self.api.heartbeat(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.invalidates_session() => {
                tracing::warn!(session_id = id, error = %e, "heartbeat rejected");
                Err(self.reject(id, &e).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// React to a session-invalidating error for `id`.
    async fn reject(&self, id: &str, error: &ApiError) -> LifecycleError {
        if let ApiError::AuthExpired(status) = error {
            self.signals.push(Signal::AuthExpired {
                session_id: id.to_string(),
                status: *status,
            });
        }
        let reason = reason_for(error);
        self.invalidate(Some(id), reason).await;
        LifecycleError::Invalidated(reason)
    }

    /// Drop the session, if it is still `expected`. Returns whether it did.
    async fn invalidate(&self, expected: Option<&str>, reason: InvalidationReason) -> bool {
        let dropped = {
            let mut bound = self.bound.write().await;
            let current = bound.session.as_ref().map(|s| s.id.as_str());
            if current.is_none() || (expected.is_some() && expected != current) {
                return false;
            }
            if let Some(handle) = bound.heartbeat.take() {
                handle.abort();
            }
            bound.context.reset();
            bound.session.take()
        };

        tracing::info!(session_id = ?dropped.as_ref().map(|s| &s.id), ?reason, "session invalidated");
        self.signals.push(Signal::SessionInvalidated {
            session_id: dropped.map(|s| s.id),
            reason,
        });
        true
    }
}

fn spawn_heartbeat<A: SessionApi + 'static>(
    core: Arc<Core<A>>,
    id: SessionId,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match core.probe(&id).await {
                Ok(()) => tracing::trace!(session_id = %id, "heartbeat ok"),
                Err(LifecycleError::Invalidated(_)) => break,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "heartbeat failed"),
            }
        }
        tracing::debug!(session_id = %id, "heartbeat stopped");
    })
}

/// Owns the server-side session and everything scoped to it.
pub struct SessionLifecycle<A: SessionApi + 'static> {
    core: Arc<Core<A>>,
    heartbeat_interval: Duration,
}

impl<A: SessionApi + 'static> SessionLifecycle<A> {
    #[must_use]
    pub fn new(api: Arc<A>, signals: Arc<SignalHub>, heartbeat_interval: Duration) -> Self {
        Self {
            core: Arc::new(Core {
                api,
                signals,
                bound: RwLock::new(Bound::default()),
            }),
            heartbeat_interval,
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.core.bound.read().await.session.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.core.session_id().await
    }

    /// Replace the current session with a fresh one.
    ///
    /// The previous session is deleted best-effort; a 404 counts as gone.
    ///
    /// # Errors
    /// Returns error if the new session cannot be created.
    pub async fn start_new_session(&self) -> Result<Session, LifecycleError> {
        let previous = self.release().await;
        if let Some(prev) = previous {
            match self.core.api.delete_session(&prev.id).await {
                Ok(()) | Err(ApiError::NotFound) => {}
                Err(e) => {
                    tracing::warn!(session_id = %prev.id, error = %e, "failed to delete previous session");
                }
            }
        }

        let session = self.core.api.create_session().await?;
        {
            let mut bound = self.core.bound.write().await;
            bound.context.reset();
            bound.session = Some(session.clone());
            bound.heartbeat = Some(spawn_heartbeat(
                Arc::clone(&self.core),
                session.id.clone(),
                self.heartbeat_interval,
            ));
        }

        tracing::info!(session_id = %session.id, "session started");
        self.core.signals.push(Signal::SessionCreated {
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    /// Delete the current session on the server and drop local state.
    ///
    /// # Errors
    /// Returns error if the delete call fails for a reason other than 404.
    pub async fn end_session(&self) -> Result<(), LifecycleError> {
        let Some(session) = self.release().await else {
            return Ok(());
        };
        self.core.signals.push(Signal::SessionInvalidated {
            session_id: Some(session.id.clone()),
            reason: InvalidationReason::Requested,
        });
        match self.core.api.delete_session(&session.id).await {
            Ok(()) | Err(ApiError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Detach the session locally without signalling.
    async fn release(&self) -> Option<Session> {
        let mut bound = self.core.bound.write().await;
        if let Some(handle) = bound.heartbeat.take() {
            handle.abort();
        }
        bound.context.reset();
        bound.session.take()
    }

    /// One heartbeat probe. A no-op without a session.
    ///
    /// # Errors
    /// Returns `Invalidated` if the server rejected the session, or the
    /// underlying error for transient failures.
    pub async fn heartbeat(&self) -> Result<(), LifecycleError> {
        let Some(id) = self.session_id().await else {
            tracing::debug!("heartbeat skipped: no session");
            return Ok(());
        };
        self.core.probe(&id).await
    }

    /// Probe the current session before a risky operation.
    ///
    /// # Errors
    /// Returns `NoSession` without a network call when there is no session.
    pub async fn ensure_valid(&self) -> Result<SessionId, LifecycleError> {
        let id = self.session_id().await.ok_or(LifecycleError::NoSession)?;
        self.core.probe(&id).await?;
        Ok(id)
    }

    /// Whether the current session is confirmed alive.
    pub async fn check_session_validity(&self) -> bool {
        self.ensure_valid().await.is_ok()
    }

    /// Drop the current session. Idempotent; returns whether anything changed.
    pub async fn invalidate(&self, reason: InvalidationReason) -> bool {
        self.core.invalidate(None, reason).await
    }

    /// Drop the current session only if it is `expected`.
    pub async fn invalidate_if(&self, expected: &str, reason: InvalidationReason) -> bool {
        self.core.invalidate(Some(expected), reason).await
    }

    /// Submit a message for the current session.
    ///
    /// # Errors
    /// Returns error if there is no session or the server rejects the call.
    pub async fn submit(&self, request: &ChatRequest) -> Result<(), LifecycleError> {
        let id = self.session_id().await.ok_or(LifecycleError::NoSession)?;
        match self.core.api.submit_message(&id, request).await {
            Ok(()) => Ok(()),
            Err(e) if e.invalidates_session() => Err(self.core.reject(&id, &e).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` against the composer context of the current session.
    pub async fn with_context<R>(&self, f: impl FnOnce(&mut ComposerContext) -> R) -> R {
        f(&mut self.core.bound.write().await.context)
    }

    pub async fn has_heartbeat(&self) -> bool {
        self.core
            .bound
            .read()
            .await
            .heartbeat
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    #[must_use]
    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.core.signals
    }
}

impl<A: SessionApi + 'static> Drop for SessionLifecycle<A> {
    fn drop(&mut self) {
        if let Ok(mut bound) = self.core.bound.try_write() {
            if let Some(handle) = bound.heartbeat.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use thought_chain_core::UploadedFile;

    use super::*;
    use crate::fakes::FakeApi;

    const PERIOD: Duration = Duration::from_secs(120);

    fn lifecycle() -> (SessionLifecycle<FakeApi>, Arc<FakeApi>, Arc<SignalHub>) {
        let api = Arc::new(FakeApi::default());
        let hub = Arc::new(SignalHub::default());
        (
            SessionLifecycle::new(Arc::clone(&api), Arc::clone(&hub), PERIOD),
            api,
            hub,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_previous_session() {
        let (lifecycle, api, hub) = lifecycle();
        let first = lifecycle.start_new_session().await.unwrap();
        lifecycle.with_context(|ctx| ctx.select_data_source("sales")).await;

        *api.delete_result.lock().unwrap() = Some(ApiError::NotFound);
        let second = lifecycle.start_new_session().await.unwrap();

        assert_eq!(api.calls(), ["create", "delete:s1", "create"]);
        assert_eq!(lifecycle.session_id().await, Some(second.id.clone()));
        assert_ne!(first.id, second.id);
        assert!(lifecycle.with_context(|ctx| ctx.is_empty()).await);
        assert_eq!(
            hub.get_history(),
            vec![
                Signal::SessionCreated { session_id: "s1".into() },
                Signal::SessionCreated { session_id: "s2".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_fires_on_interval() {
        let (lifecycle, api, _hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();

        tokio::time::sleep(PERIOD / 2).await;
        settle().await;
        assert_eq!(api.count("heartbeat"), 0);

        tokio::time::sleep(PERIOD * 2).await;
        settle().await;
        assert_eq!(api.count("heartbeat:s1"), 2);
        assert!(lifecycle.has_heartbeat().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_not_found_invalidates() {
        let (lifecycle, api, hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();
        lifecycle
            .with_context(|ctx| {
                ctx.stage_upload(UploadedFile {
                    file_id: None,
                    original_name: "a.csv".into(),
                    saved_name: "a.csv".into(),
                    saved_path: "/up/a.csv".into(),
                    size: None,
                });
            })
            .await;
        api.fail_heartbeat(ApiError::NotFound);

        tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(lifecycle.session_id().await, None);
        assert!(!lifecycle.has_heartbeat().await);
        assert!(lifecycle.with_context(|ctx| ctx.is_empty()).await);
        assert!(hub.get_history().contains(&Signal::SessionInvalidated {
            session_id: Some("s1".into()),
            reason: InvalidationReason::NotFound,
        }));

        // No further probes, and none without a session.
        tokio::time::sleep(PERIOD * 5).await;
        tokio_test::assert_ok!(lifecycle.heartbeat().await);
        assert!(!lifecycle.check_session_validity().await);
        assert_eq!(api.count("heartbeat"), 1);
    }

    #[tokio::test]
    async fn test_auth_expired_signals() {
        let (lifecycle, api, hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();
        api.fail_heartbeat(ApiError::AuthExpired(401));

        assert!(!lifecycle.check_session_validity().await);
        assert_eq!(
            hub.get_history()[1..],
            [
                Signal::AuthExpired {
                    session_id: "s1".into(),
                    status: 401,
                },
                Signal::SessionInvalidated {
                    session_id: Some("s1".into()),
                    reason: InvalidationReason::AuthExpired,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_session() {
        let (lifecycle, api, _hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();
        api.fail_heartbeat(ApiError::Network("timeout".into()));

        assert!(matches!(lifecycle.heartbeat().await, Err(LifecycleError::Api(_))));
        assert_eq!(lifecycle.session_id().await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let (lifecycle, _api, hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();

        assert!(lifecycle.invalidate(InvalidationReason::Requested).await);
        assert!(!lifecycle.invalidate(InvalidationReason::Requested).await);
        assert_eq!(lifecycle.session_id().await, None);
        assert_eq!(hub.get_history().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_if_ignores_other_sessions() {
        let (lifecycle, _api, hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();
        let current = lifecycle.start_new_session().await.unwrap();

        assert!(!lifecycle.invalidate_if("s1", InvalidationReason::NotFound).await);
        assert_eq!(lifecycle.session_id().await, Some(current.id.clone()));
        assert!(lifecycle.has_heartbeat().await);

        assert!(lifecycle.invalidate_if(&current.id, InvalidationReason::NotFound).await);
        assert_eq!(lifecycle.session_id().await, None);
        assert_eq!(
            hub.get_history().last(),
            Some(&Signal::SessionInvalidated {
                session_id: Some("s2".into()),
                reason: InvalidationReason::NotFound,
            })
        );
    }

    #[tokio::test]
    async fn test_submit_without_session() {
        let (lifecycle, api, _hub) = lifecycle();
        let mut ctx = ComposerContext::new();
        let request = ctx.take_request("hi").unwrap();
        assert!(matches!(
            lifecycle.submit(&request).await,
            Err(LifecycleError::NoSession)
        ));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_end_session_tolerates_missing() {
        let (lifecycle, api, _hub) = lifecycle();
        lifecycle.start_new_session().await.unwrap();
        *api.delete_result.lock().unwrap() = Some(ApiError::NotFound);

        tokio_test::assert_ok!(lifecycle.end_session().await);
        tokio_test::assert_ok!(lifecycle.end_session().await);
        assert_eq!(api.count("delete"), 1);
        assert_eq!(lifecycle.session_id().await, None);
    }
}
