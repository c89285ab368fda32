//! Coordination client with fixed-interval connect retry and session state
//! observability.
//!
//! Wraps a [`CoordinationBackend`] to provide a session layer the registrar,
//! watcher, and reconnect supervisor can share. State changes from every
//! session the client opens are re-broadcast on one client-level channel, so
//! subscribers survive a session rebuild.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{
    CoordinationBackend, CreateMode, Session, SessionId, SessionTimeouts, WatchStream,
};
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::RegistryKey;

/// Default delay between connection attempts.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the client-level session state channel.
const STATE_CHANNEL_SIZE: usize = 64;

/// Session state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session; never connected or explicitly disconnected.
    Disconnected,
    /// Connection attempts in progress.
    Connecting,
    /// Session established and usable.
    Connected,
    /// Connection interrupted; the session may still resume.
    Suspended,
    /// The service expired the session; its ephemeral keys are gone.
    Lost,
}

impl SessionState {
    /// Transition table. Anything not listed is ignored by the client.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Suspended)
                | (Connected, Lost)
                | (Connected, Disconnected)
                | (Suspended, Connected)
                | (Suspended, Lost)
                | (Suspended, Disconnected)
                | (Lost, Connecting)
                | (Lost, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Lost => write!(f, "lost"),
        }
    }
}

/// Connection retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Upper bound on attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(DEFAULT_RETRY_INTERVAL)
    }
}

/// Validated client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: String,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            session: self.session_timeout,
            connection: self.connection_timeout,
        }
    }
}

/// Inner state shared behind Arc<RwLock<…>>.
struct ClientInner {
    session: Option<Arc<dyn Session>>,
    state: SessionState,
    forwarder: Option<JoinHandle<()>>,
}

/// Apply `next` if the transition table allows it, broadcasting the change.
fn apply_transition(
    inner: &mut ClientInner,
    tx: &broadcast::Sender<SessionState>,
    next: SessionState,
) -> bool {
    let current = inner.state;
    if current == next {
        return false;
    }
    if !current.can_transition_to(next) {
        debug!(%current, %next, "ignoring invalid session state transition");
        return false;
    }
    inner.state = next;
    // no subscribers is fine
    let _ = tx.send(next);
    debug!(from = %current, to = %next, "session state changed");
    true
}

/// Client for the coordination service.
///
/// Provides:
/// - Blocking connect with a fixed-interval retry policy
/// - Session state notifications that outlive individual sessions
/// - Ephemeral-sequential create, read, delete, and child watches that map
///   failures to typed `CoordinationError`
/// - Cancellation of an in-progress connect on shutdown
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<RwLock<ClientInner>>,
    backend: Arc<dyn CoordinationBackend>,
    config: Arc<ClientConfig>,
    state_tx: broadcast::Sender<SessionState>,
    cancel: CancellationToken,
}

impl CoordinationClient {
    /// Create a new client, without connecting yet.
    ///
    /// Call [`connect`](Self::connect) to open a session.
    pub fn new(backend: Arc<dyn CoordinationBackend>, config: ClientConfig) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_SIZE);
        Self {
            inner: Arc::new(RwLock::new(ClientInner {
                session: None,
                state: SessionState::Disconnected,
                forwarder: None,
            })),
            backend,
            config: Arc::new(config),
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Open a session, blocking until it is `Connected` or connecting fails
    /// fatally.
    ///
    /// Retries with the configured fixed interval; with no attempt bound this
    /// only returns once connected, cancelled, or on a non-retryable error.
    pub async fn connect(&self) -> CoordinationResult<()> {
        let stale = {
            let inner = self.inner.read().await;
            match (&inner.session, inner.state) {
                (Some(_), SessionState::Connected) => {
                    debug!("coordination client already connected, skipping connect");
                    return Ok(());
                }
                (Some(_), _) => true,
                (None, _) => false,
            }
        };
        if stale {
            self.disconnect().await;
        }

        info!(
            url = %self.config.url,
            session_timeout_ms = self.config.session_timeout.as_millis(),
            connection_timeout_ms = self.config.connection_timeout.as_millis(),
            retry_interval_ms = self.config.retry.interval.as_millis(),
            max_attempts = ?self.config.retry.max_attempts,
            "connecting to coordination service"
        );
        self.transition(SessionState::Connecting).await;

        let timeouts = self.config.timeouts();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(CoordinationError::Cancelled(
                    "coordination client closed while connecting".into(),
                )),
                res = tokio::time::timeout(
                    self.config.connection_timeout,
                    self.backend.connect(&self.config.url, timeouts),
                ) => match res {
                    Ok(res) => res,
                    Err(_) => Err(CoordinationError::Timeout(format!(
                        "connection attempt timed out after {:?}",
                        self.config.connection_timeout
                    ))),
                },
            };

            match result {
                Ok(session) => {
                    let id = session.id();
                    self.install(session).await;
                    info!(attempt, session = %id, "coordination session established");
                    return Ok(());
                }
                Err(err @ CoordinationError::Cancelled(_)) => {
                    info!(attempt, "coordination connect cancelled");
                    self.transition(SessionState::Disconnected).await;
                    return Err(err);
                }
                Err(err) if !err.is_retryable() => {
                    error!(attempt, error = %err, "coordination connect failed");
                    self.transition(SessionState::Disconnected).await;
                    return Err(err);
                }
                Err(err) => {
                    if let Some(max_attempts) = self.config.retry.max_attempts {
                        if attempt >= max_attempts {
                            error!(
                                attempts = attempt,
                                error = %err,
                                "coordination connect failed after all retry attempts"
                            );
                            self.transition(SessionState::Disconnected).await;
                            return Err(CoordinationError::Transport(format!(
                                "connection to '{}' failed after {attempt} attempt(s): {err}",
                                self.config.url
                            )));
                        }
                    }
                    warn!(
                        attempt,
                        max_attempts = ?self.config.retry.max_attempts,
                        retry_in_ms = self.config.retry.interval.as_millis(),
                        error = %err,
                        "coordination connect attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.retry.interval) => {}
                    }
                }
            }
        }
    }

    /// Install a fresh session and start forwarding its state changes.
    async fn install(&self, session: Arc<dyn Session>) {
        let mut changes = session.state_changes();
        let id = session.id();

        let mut inner = self.inner.write().await;
        if let Some(old) = inner.forwarder.take() {
            old.abort();
        }
        inner.session = Some(Arc::clone(&session));
        apply_transition(&mut inner, &self.state_tx, SessionState::Connected);
        // the session may have moved on before we subscribed
        let current = session.state();
        apply_transition(&mut inner, &self.state_tx, current);

        let shared = Arc::clone(&self.inner);
        let tx = self.state_tx.clone();
        inner.forwarder = Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(next) => {
                        let mut inner = shared.write().await;
                        if !is_current(&inner, id) {
                            debug!(session = %id, %next, "dropping state change from a torn-down session");
                            return;
                        }
                        apply_transition(&mut inner, &tx, next);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %id, skipped, "session state notifications lagged");
                        let mut inner = shared.write().await;
                        let latest = match &inner.session {
                            Some(session) if session.id() == id => session.state(),
                            _ => return,
                        };
                        apply_transition(&mut inner, &tx, latest);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    async fn transition(&self, next: SessionState) -> bool {
        let mut inner = self.inner.write().await;
        apply_transition(&mut inner, &self.state_tx, next)
    }

    /// Returns the current session state.
    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    /// Returns true if the client has a connected session.
    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Subscribe to session state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the session is `Connected`. Returns false on timeout.
    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.state_tx.subscribe();
        if self.is_connected().await {
            return true;
        }
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(SessionState::Connected) => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected().await {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Returns the id of the current session, if any.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.read().await.session.as_ref().map(|s| s.id())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the current session. Returns an error unless it is connected.
    async fn session(&self) -> CoordinationResult<Arc<dyn Session>> {
        let inner = self.inner.read().await;
        match (&inner.session, inner.state) {
            (Some(session), SessionState::Connected) => Ok(Arc::clone(session)),
            (Some(session), SessionState::Lost) => Err(CoordinationError::SessionExpired(
                format!("session {} expired", session.id()),
            )),
            (Some(session), state) => Err(CoordinationError::NotConnected(format!(
                "session {} is {state}",
                session.id()
            ))),
            (None, _) => Err(CoordinationError::NotConnected(
                "coordination client not connected".into(),
            )),
        }
    }

    /// Create an ephemeral-sequential key under `path_prefix`.
    pub async fn create_ephemeral(
        &self,
        path_prefix: &str,
        payload: Vec<u8>,
    ) -> CoordinationResult<RegistryKey> {
        let session = self.session().await?;
        let path = session
            .create(path_prefix, payload, CreateMode::EphemeralSequential)
            .await?;
        Ok(RegistryKey::new(path))
    }

    /// Delete a key.
    pub async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.session().await?.delete(path).await
    }

    /// Read a key's payload.
    pub async fn read(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.session().await?.get(path).await
    }

    /// Watch the direct children of `parent`.
    pub async fn watch_children(&self, parent: &str) -> CoordinationResult<WatchStream> {
        self.session().await?.watch_children(parent).await
    }

    /// Close the current session, keeping the client reusable.
    pub async fn disconnect(&self) {
        let session = {
            let mut inner = self.inner.write().await;
            if let Some(forwarder) = inner.forwarder.take() {
                forwarder.abort();
            }
            let session = inner.session.take();
            apply_transition(&mut inner, &self.state_tx, SessionState::Disconnected);
            session
        };
        if let Some(session) = session {
            debug!(session = %session.id(), "closing coordination session");
            session.close().await;
            info!("coordination client disconnected");
        }
    }

    /// Abort any in-progress connect and refuse further ones.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) or [`close`](Self::close)
    /// was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and disconnect.
    pub async fn close(&self) {
        self.cancel();
        self.disconnect().await;
    }
}

fn is_current(inner: &ClientInner, id: SessionId) -> bool {
    inner.session.as_ref().is_some_and(|s| s.id() == id)
}

impl fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
