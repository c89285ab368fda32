//! etcd-backed coordination service.
//!
//! Maps the session contract onto etcd primitives:
//! - session: a lease with TTL equal to the session timeout, refreshed by a
//!   keep-alive task. A failed refresh suspends the session; once the TTL has
//!   run out without a successful refresh (or etcd reports TTL 0) it is lost.
//! - ephemeral key: a key attached to the lease.
//! - sequential naming: a counter stored at the parent key, bumped in a
//!   compare-and-swap transaction.
//! - child watch: a prefix watch on `<parent>/`, filtered to direct children.
//!
//! etcd has no hierarchy, so "missing parents" need no creating.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    CoordinationBackend, CreateMode, Session, SessionId, SessionTimeouts, WatchEvent, WatchStream,
    is_direct_child, parent_of, sequential_path,
};
use crate::client::SessionState;
use crate::error::{CoordinationError, CoordinationResult};

/// Url scheme accepted by [`EtcdBackend`].
pub const ETCD_SCHEME: &str = "etcd://";

/// Attempts at bumping a sequence counter before giving up.
const MAX_SEQUENCE_ATTEMPTS: usize = 16;

const SESSION_CHANNEL_SIZE: usize = 16;

/// Split an `etcd://h1:2379,h2:2379` url into client endpoints.
pub fn parse_endpoints(url: &str) -> CoordinationResult<Vec<String>> {
    let rest = url.strip_prefix(ETCD_SCHEME).ok_or_else(|| {
        CoordinationError::Config(format!("etcd url must start with {ETCD_SCHEME}: {url}"))
    })?;
    let endpoints: Vec<String> = rest
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| format!("http://{}", e.trim_end_matches('/')))
        .collect();
    if endpoints.is_empty() {
        return Err(CoordinationError::Config(format!(
            "etcd url has no endpoints: {url}"
        )));
    }
    Ok(endpoints)
}

/// Lease TTL in whole seconds, rounded up, at least one.
pub fn lease_ttl_secs(session_timeout: Duration) -> i64 {
    let millis = session_timeout.as_millis().max(1);
    let secs = millis.div_ceil(1000);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Keep-alive period for a lease TTL: a third of the TTL.
pub fn keepalive_interval(ttl_secs: i64) -> Duration {
    let millis = u64::try_from(ttl_secs.max(1)).unwrap_or(1) * 1000 / 3;
    Duration::from_millis(millis)
}

/// Parse the sequence counter stored at a parent key. Missing means zero.
fn parse_counter(value: Option<&[u8]>) -> CoordinationResult<u64> {
    match value {
        None => Ok(0),
        Some([]) => Ok(0),
        Some(raw) => std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                CoordinationError::Protocol(format!(
                    "parent key holds a non-numeric sequence counter: {}",
                    String::from_utf8_lossy(raw)
                ))
            }),
    }
}

fn transport(err: etcd_client::Error) -> CoordinationError {
    CoordinationError::Transport(err.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdBackend;

impl EtcdBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    async fn connect(
        &self,
        url: &str,
        timeouts: SessionTimeouts,
    ) -> CoordinationResult<Arc<dyn Session>> {
        let endpoints = parse_endpoints(url)?;
        let options = ConnectOptions::new()
            .with_connect_timeout(timeouts.connection)
            .with_timeout(timeouts.connection);
        let mut client = Client::connect(endpoints, Some(options))
            .await
            .map_err(transport)?;

        let ttl = lease_ttl_secs(timeouts.session);
        let lease = client.lease_grant(ttl, None).await.map_err(transport)?.id();
        let (keeper, stream) = client.lease_keep_alive(lease).await.map_err(transport)?;
        debug!(lease_id = lease, ttl, "etcd lease granted");

        let (changes, _) = broadcast::channel(SESSION_CHANNEL_SIZE);
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState::Connected),
            changes,
            cancel: CancellationToken::new(),
        });
        let keepalive = spawn_keepalive_task(
            client.clone(),
            keeper,
            stream,
            lease,
            ttl,
            Arc::clone(&shared),
        );
        Ok(Arc::new(EtcdSession {
            id: SessionId(lease),
            client,
            shared,
            keepalive: Mutex::new(Some(keepalive)),
        }))
    }
}

#[derive(Debug)]
struct SessionShared {
    state: Mutex<SessionState>,
    changes: broadcast::Sender<SessionState>,
    /// Cancelled once the session ends; stops keep-alive and watches.
    cancel: CancellationToken,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == next || !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        let _ = self.changes.send(next);
        true
    }

    fn end(&self, next: SessionState) {
        self.set(next);
        self.cancel.cancel();
    }

    fn check(&self, id: SessionId) -> CoordinationResult<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::Suspended => Err(CoordinationError::NotConnected(format!(
                "session {id} is suspended"
            ))),
            _ => Err(CoordinationError::SessionExpired(format!(
                "session {id} is no longer valid"
            ))),
        }
    }
}

/// Refresh the lease until the session ends.
///
/// Failed refreshes re-open the keep-alive stream; the session is `Suspended`
/// meanwhile and `Lost` once a full TTL passes without a refresh.
fn spawn_keepalive_task(
    mut client: Client,
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    ttl: i64,
    shared: Arc<SessionShared>,
) -> JoinHandle<()> {
    let ttl_window = Duration::from_secs(u64::try_from(ttl).unwrap_or(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive_interval(ttl));
        ticker.tick().await; // first tick is immediate
        let mut last_ok = Instant::now();
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let refreshed = match keeper.keep_alive().await {
                Ok(()) => match stream.message().await {
                    Ok(Some(resp)) => Ok(resp.ttl()),
                    Ok(None) => Err("keep-alive stream closed".to_owned()),
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e.to_string()),
            };

            match refreshed {
                Ok(remaining) if remaining > 0 => {
                    trace!(lease_id, ttl = remaining, "keep-alive ok");
                    last_ok = Instant::now();
                    if shared.set(SessionState::Connected) {
                        info!(lease_id, "etcd session resumed");
                    }
                }
                Ok(_) => {
                    error!(lease_id, "etcd lease expired");
                    shared.end(SessionState::Lost);
                    return;
                }
                Err(e) => {
                    warn!(lease_id, error = %e, "keep-alive failed");
                    shared.set(SessionState::Suspended);
                    if last_ok.elapsed() >= ttl_window {
                        error!(lease_id, "no keep-alive within the lease ttl, session lost");
                        shared.end(SessionState::Lost);
                        return;
                    }
                    match client.lease_keep_alive(lease_id).await {
                        Ok((k, s)) => {
                            keeper = k;
                            stream = s;
                        }
                        Err(e) => debug!(lease_id, error = %e, "re-opening keep-alive failed"),
                    }
                }
            }
        }
    })
}

/// One etcd lease acting as a session.
#[derive(Debug)]
pub struct EtcdSession {
    id: SessionId,
    client: Client,
    shared: Arc<SessionShared>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdSession {
    /// Reserve the next sequence number under `parent`.
    async fn next_sequence(&self, parent: &str) -> CoordinationResult<u64> {
        let mut client = self.client.clone();
        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let resp = client.get(parent, None).await.map_err(transport)?;
            let (current, version) = match resp.kvs().first() {
                Some(kv) => (parse_counter(Some(kv.value()))?, kv.version()),
                None => (0, 0),
            };
            let next = current + 1;
            let txn = Txn::new()
                .when(vec![Compare::version(parent, CompareOp::Equal, version)])
                .and_then(vec![TxnOp::put(parent, next.to_string(), None)]);
            if client.txn(txn).await.map_err(transport)?.succeeded() {
                return Ok(next);
            }
            trace!(parent, "sequence counter raced, retrying");
        }
        Err(CoordinationError::Protocol(format!(
            "could not reserve a sequence under {parent}"
        )))
    }
}

#[async_trait]
impl Session for EtcdSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        self.shared.state()
    }

    fn state_changes(&self) -> broadcast::Receiver<SessionState> {
        self.shared.changes.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        self.shared.check(self.id)?;
        let path = if mode.is_sequential() {
            let parent = parent_of(path).unwrap_or_default();
            sequential_path(path, self.next_sequence(parent).await?)
        } else {
            path.to_owned()
        };
        let options = mode
            .is_ephemeral()
            .then(|| PutOptions::new().with_lease(self.id.0));
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                path.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(path.as_str(), data, options)]);
        let mut client = self.client.clone();
        if !client.txn(txn).await.map_err(transport)?.succeeded() {
            return Err(CoordinationError::NodeExists(path));
        }
        Ok(path)
    }

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.shared.check(self.id)?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(transport)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.shared.check(self.id)?;
        let mut client = self.client.clone();
        let resp = client.delete(path, None).await.map_err(transport)?;
        if resp.deleted() == 0 {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        Ok(())
    }

    async fn watch_children(&self, parent: &str) -> CoordinationResult<WatchStream> {
        self.shared.check(self.id)?;
        let prefix = format!("{parent}/");
        let mut client = self.client.clone();

        let snapshot = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        let revision = snapshot.header().map(|h| h.revision()).unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        for kv in snapshot.kvs() {
            let Ok(key) = kv.key_str() else { continue };
            if is_direct_child(parent, key) {
                let _ = tx.send(WatchEvent::added(key, kv.value().to_vec()));
            }
        }

        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(revision + 1);
        let (watcher, mut stream) = client
            .watch(prefix.as_str(), Some(options))
            .await
            .map_err(transport)?;

        let parent = parent.to_owned();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            // dropping the watcher cancels the server-side watch
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(parent = %parent, error = %e, "etcd watch failed");
                        return;
                    }
                };
                if resp.canceled() {
                    warn!(parent = %parent, "etcd watch canceled");
                    return;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    if !is_direct_child(&parent, key) {
                        continue;
                    }
                    let change = match event.event_type() {
                        EventType::Put if kv.version() == 1 => {
                            WatchEvent::added(key, kv.value().to_vec())
                        }
                        EventType::Put => WatchEvent::updated(key, kv.value().to_vec()),
                        EventType::Delete => {
                            WatchEvent::removed(key, event.prev_kv().map(|p| p.value().to_vec()))
                        }
                    };
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) {
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        self.shared.end(SessionState::Disconnected);
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(self.id.0).await {
            debug!(lease_id = self.id.0, error = %e, "lease revoke failed, it will expire on its own");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("etcd://10.0.0.1:2379, 10.0.0.2:2379/").unwrap(),
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
        assert!(matches!(
            parse_endpoints("etcd://").unwrap_err(),
            CoordinationError::Config(_)
        ));
        assert!(matches!(
            parse_endpoints("memory://x").unwrap_err(),
            CoordinationError::Config(_)
        ));
    }

    #[test]
    fn test_lease_ttl_rounds_up() {
        assert_eq!(lease_ttl_secs(Duration::from_millis(10_000)), 10);
        assert_eq!(lease_ttl_secs(Duration::from_millis(10_001)), 11);
        assert_eq!(lease_ttl_secs(Duration::from_millis(0)), 1);
    }

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(keepalive_interval(9), Duration::from_secs(3));
        assert_eq!(keepalive_interval(0), Duration::from_millis(333));
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter(None).unwrap(), 0);
        assert_eq!(parse_counter(Some(b"")).unwrap(), 0);
        assert_eq!(parse_counter(Some(b"41")).unwrap(), 41);
        assert!(parse_counter(Some(b"nodes")).is_err());
    }

    #[test]
    fn test_session_shared_transitions() {
        let (changes, mut rx) = broadcast::channel(4);
        let shared = SessionShared {
            state: Mutex::new(SessionState::Connected),
            changes,
            cancel: CancellationToken::new(),
        };
        assert!(shared.check(SessionId(1)).is_ok());
        assert!(shared.set(SessionState::Suspended));
        assert!(!shared.set(SessionState::Suspended));
        assert!(shared.check(SessionId(1)).unwrap_err().is_retryable());
        shared.end(SessionState::Lost);
        assert!(shared.cancel.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), SessionState::Suspended);
        assert_eq!(rx.try_recv().unwrap(), SessionState::Lost);
    }
}
