//! In-process coordination service.
//!
//! Implements the same session semantics as a ZooKeeper ensemble: ephemeral
//! keys die with their session, sequential keys get a per-parent counter, and
//! child watches see every add/remove. Used by the test suites and by
//! `memory://` urls for single-host development. Operator controls
//! ([`MemoryCoordinator::expire_session`] and friends) inject the faults a
//! real ensemble would produce.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::backend::{
    CoordinationBackend, CreateMode, Session, SessionId, SessionTimeouts, WatchEvent, WatchStream,
    is_direct_child, parent_of, sequential_path,
};
use crate::client::SessionState;
use crate::error::{CoordinationError, CoordinationResult};

/// Url scheme accepted by [`MemoryCoordinator`].
pub const MEMORY_SCHEME: &str = "memory://";

const SESSION_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    nodes: BTreeMap<String, MemoryNode>,
    sequences: HashMap<String, u64>,
    sessions: HashMap<SessionId, SessionEntry>,
    watchers: Vec<ChildWatcher>,
    next_session: i64,
    unreachable: bool,
    connect_attempts: u64,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct SessionEntry {
    state: SessionState,
    changes: broadcast::Sender<SessionState>,
    timeouts: SessionTimeouts,
}

#[derive(Debug)]
struct ChildWatcher {
    session: SessionId,
    parent: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl MemoryInner {
    fn check_session(&self, id: SessionId) -> CoordinationResult<()> {
        match self.sessions.get(&id).map(|e| e.state) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Suspended) => Err(CoordinationError::NotConnected(format!(
                "session {id} is suspended"
            ))),
            _ => Err(CoordinationError::SessionExpired(format!(
                "session {id} is no longer valid"
            ))),
        }
    }

    /// Deliver `event` to every watcher of `parent`, dropping closed ones.
    fn notify(&mut self, parent: &str, event: WatchEvent) {
        self.watchers.retain(|w| {
            if w.parent != parent {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn notify_parent(&mut self, path: &str, event: WatchEvent) {
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_owned();
            self.notify(&parent, event);
        }
    }

    fn set_session_state(&mut self, id: SessionId, from: SessionState, to: SessionState) -> bool {
        match self.sessions.get_mut(&id) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                let _ = entry.changes.send(to);
                debug!(session = %id, %from, %to, "memory session state changed");
                true
            }
            _ => false,
        }
    }

    /// End a session: drop its watches and remove every ephemeral it owns.
    fn end_session(&mut self, id: SessionId, state: SessionState) -> bool {
        match self.sessions.get_mut(&id) {
            Some(entry)
                if matches!(entry.state, SessionState::Connected | SessionState::Suspended) =>
            {
                entry.state = state;
                let _ = entry.changes.send(state);
            }
            _ => return false,
        }
        self.watchers.retain(|w| w.session != id);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            if let Some(node) = self.nodes.remove(&path) {
                self.notify_parent(&path, WatchEvent::removed(path.clone(), Some(node.data)));
            }
        }
        debug!(session = %id, %state, "memory session ended");
        true
    }

    fn create_node(
        &mut self,
        path: &str,
        data: Vec<u8>,
        owner: Option<SessionId>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        if !path.starts_with('/') {
            return Err(CoordinationError::Protocol(format!(
                "path must be absolute: {path}"
            )));
        }
        let path = if mode.is_sequential() {
            let counter_key = parent_of(path).unwrap_or_default().to_owned();
            let counter = self.sequences.entry(counter_key).or_insert(0);
            *counter += 1;
            sequential_path(path, *counter)
        } else {
            path.to_owned()
        };
        if path.len() > 1 && path.ends_with('/') {
            return Err(CoordinationError::Protocol(format!(
                "path must not end with '/': {path}"
            )));
        }
        if self.nodes.contains_key(&path) {
            return Err(CoordinationError::NodeExists(path));
        }

        let mut missing = Vec::new();
        let mut cursor = parent_of(&path);
        while let Some(ancestor) = cursor {
            if self.nodes.contains_key(ancestor) {
                break;
            }
            missing.push(ancestor.to_owned());
            cursor = parent_of(ancestor);
        }
        for ancestor in missing.into_iter().rev() {
            self.nodes.insert(
                ancestor.clone(),
                MemoryNode {
                    data: Vec::new(),
                    owner: None,
                },
            );
            self.notify_parent(&ancestor, WatchEvent::added(ancestor.clone(), Vec::new()));
        }

        let owner = if mode.is_ephemeral() { owner } else { None };
        self.nodes.insert(
            path.clone(),
            MemoryNode {
                data: data.clone(),
                owner,
            },
        );
        self.notify_parent(&path, WatchEvent::added(path.clone(), data));
        Ok(path)
    }

    fn delete_node(&mut self, path: &str) -> CoordinationResult<()> {
        let prefix = format!("{path}/");
        if self
            .nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
        {
            return Err(CoordinationError::Protocol(format!(
                "node has children: {path}"
            )));
        }
        let node = self
            .nodes
            .remove(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
        self.notify_parent(path, WatchEvent::removed(path, Some(node.data)));
        Ok(())
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make new connection attempts fail with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unreachable = !reachable;
    }

    /// Number of connect calls seen, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.lock().connect_attempts
    }

    /// Ids of sessions that have not ended, in creation order.
    pub fn sessions(&self) -> Vec<SessionId> {
        let inner = self.inner.lock();
        let mut ids: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, e)| matches!(e.state, SessionState::Connected | SessionState::Suspended))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.inner.lock().sessions.get(&id).map(|e| e.state)
    }

    /// Session timeout the client asked for when it connected.
    pub fn session_timeout(&self, id: SessionId) -> Option<std::time::Duration> {
        self.inner.lock().sessions.get(&id).map(|e| e.timeouts.session)
    }

    /// Interrupt a session's connection without expiring it.
    pub fn suspend_session(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .set_session_state(id, SessionState::Connected, SessionState::Suspended)
    }

    /// Restore a suspended session.
    pub fn resume_session(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .set_session_state(id, SessionState::Suspended, SessionState::Connected)
    }

    /// Expire a session, removing its ephemeral keys.
    pub fn expire_session(&self, id: SessionId) -> bool {
        self.inner.lock().end_session(id, SessionState::Lost)
    }

    /// Create or replace a persistent key.
    pub fn put(&self, path: &str, data: Vec<u8>) -> CoordinationResult<()> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(path) {
            node.data = data.clone();
            inner.notify_parent(path, WatchEvent::updated(path, data));
            return Ok(());
        }
        inner
            .create_node(path, data, None, CreateMode::Persistent)
            .map(|_| ())
    }

    /// Replace the payload of an existing key.
    pub fn set_data(&self, path: &str, data: Vec<u8>) -> CoordinationResult<()> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
        node.data = data.clone();
        inner.notify_parent(path, WatchEvent::updated(path, data));
        Ok(())
    }

    /// Delete any key, as an operator would.
    pub fn remove(&self, path: &str) -> CoordinationResult<()> {
        self.inner.lock().delete_node(path)
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Sorted paths of the direct children of `parent`.
    pub fn children(&self, parent: &str) -> Vec<String> {
        self.inner
            .lock()
            .nodes
            .keys()
            .filter(|path| is_direct_child(parent, path))
            .cloned()
            .collect()
    }

    /// Session owning an ephemeral key.
    pub fn ephemeral_owner(&self, path: &str) -> Option<SessionId> {
        self.inner.lock().nodes.get(path).and_then(|n| n.owner)
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordinator {
    async fn connect(
        &self,
        url: &str,
        timeouts: SessionTimeouts,
    ) -> CoordinationResult<Arc<dyn Session>> {
        let mut inner = self.inner.lock();
        inner.connect_attempts += 1;
        if !url.starts_with(MEMORY_SCHEME) {
            return Err(CoordinationError::Config(format!(
                "unsupported url for the in-memory service: {url}"
            )));
        }
        if inner.unreachable {
            return Err(CoordinationError::Transport(format!(
                "coordination service at '{url}' is unreachable"
            )));
        }
        inner.next_session += 1;
        let id = SessionId(inner.next_session);
        let (changes, _) = broadcast::channel(SESSION_CHANNEL_SIZE);
        inner.sessions.insert(
            id,
            SessionEntry {
                state: SessionState::Connected,
                changes: changes.clone(),
                timeouts,
            },
        );
        debug!(session = %id, "memory session opened");
        Ok(Arc::new(MemorySession {
            id,
            service: self.clone(),
            changes,
        }))
    }
}

/// Session handle returned by [`MemoryCoordinator`].
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    service: MemoryCoordinator,
    changes: broadcast::Sender<SessionState>,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        self.service
            .session_state(self.id)
            .unwrap_or(SessionState::Lost)
    }

    fn state_changes(&self) -> broadcast::Receiver<SessionState> {
        self.changes.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let mut inner = self.service.inner.lock();
        inner.check_session(self.id)?;
        inner.create_node(path, data, Some(self.id), mode)
    }

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        let inner = self.service.inner.lock();
        inner.check_session(self.id)?;
        inner
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        let mut inner = self.service.inner.lock();
        inner.check_session(self.id)?;
        inner.delete_node(path)
    }

    async fn watch_children(&self, parent: &str) -> CoordinationResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.service.inner.lock();
            inner.check_session(self.id)?;
            for (path, node) in inner.nodes.iter() {
                if is_direct_child(parent, path) {
                    // receiver is held right here
                    let _ = tx.send(WatchEvent::added(path.clone(), node.data.clone()));
                }
            }
            inner.watchers.push(ChildWatcher {
                session: self.id,
                parent: parent.to_owned(),
                tx,
            });
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) {
        self.service
            .inner
            .lock()
            .end_session(self.id, SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::WatchEventKind;

    const URL: &str = "memory://test";

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            session: Duration::from_secs(10),
            connection: Duration::from_secs(2),
        }
    }

    async fn next_event(stream: &mut WatchStream) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for watch event")
            .expect("watch stream ended")
    }

    #[tokio::test]
    async fn test_sequential_names_are_monotonic() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        let first = session
            .create("/macondo/nodes/", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = session
            .create("/macondo/nodes/", b"b".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/macondo/nodes/0000000001");
        assert_eq!(second, "/macondo/nodes/0000000002");

        // a deleted sequence is never reused
        session.delete(&second).await.unwrap();
        let third = session
            .create("/macondo/nodes/", b"c".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(third, "/macondo/nodes/0000000003");
    }

    #[tokio::test]
    async fn test_create_makes_persistent_parents() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        session
            .create("/macondo/nodes/", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(service.get("/macondo"), Some(Vec::new()));
        assert_eq!(service.ephemeral_owner("/macondo/nodes"), None);

        session.close().await;
        assert!(service.children("/macondo/nodes").is_empty());
        assert_eq!(service.get("/macondo/nodes"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_expire_removes_only_owned_ephemerals() {
        let service = MemoryCoordinator::new();
        let a = service.connect(URL, timeouts()).await.unwrap();
        let b = service.connect(URL, timeouts()).await.unwrap();
        let key_a = a
            .create("/macondo/nodes/", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let key_b = b
            .create("/macondo/nodes/", b"b".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert!(service.expire_session(a.id()));
        assert!(!service.expire_session(a.id()));
        assert_eq!(a.state(), SessionState::Lost);
        assert!(service.get(&key_a).is_none());
        assert!(service.get(&key_b).is_some());
        assert_eq!(service.sessions(), vec![b.id()]);

        let err = a.get(&key_b).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams_changes() {
        let service = MemoryCoordinator::new();
        service.put("/macondo/nodes/0000000001", b"old".to_vec()).unwrap();
        let session = service.connect(URL, timeouts()).await.unwrap();
        let mut stream = session.watch_children("/macondo/nodes").await.unwrap();

        let replay = next_event(&mut stream).await;
        assert_eq!(replay, WatchEvent::added("/macondo/nodes/0000000001", b"old".to_vec()));

        service.set_data("/macondo/nodes/0000000001", b"new".to_vec()).unwrap();
        let update = next_event(&mut stream).await;
        assert_eq!(update.kind, WatchEventKind::Updated);
        assert_eq!(update.data, Some(b"new".to_vec()));

        service.remove("/macondo/nodes/0000000001").unwrap();
        let removed = next_event(&mut stream).await;
        assert_eq!(removed.kind, WatchEventKind::Removed);
        assert_eq!(removed.data, Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_watch_ignores_grandchildren() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        let mut stream = session.watch_children("/macondo/nodes").await.unwrap();
        service.put("/macondo/nodes/a/b", b"deep".to_vec()).unwrap();

        // only the intermediate child surfaces
        let event = next_event(&mut stream).await;
        assert_eq!(event.path, "/macondo/nodes/a");
        let none = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_watch_ends_with_session() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        let mut stream = session.watch_children("/macondo/nodes").await.unwrap();
        service.expire_session(session.id());
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_suspended_session_refuses_operations() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        let mut changes = session.state_changes();
        assert!(service.suspend_session(session.id()));
        assert_eq!(changes.recv().await.unwrap(), SessionState::Suspended);

        let err = session.get("/macondo").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotConnected(_)));

        assert!(service.resume_session(session.id()));
        assert_eq!(changes.recv().await.unwrap(), SessionState::Connected);
        assert!(session.get("/macondo").await.unwrap_err().is_no_node());
    }

    #[tokio::test]
    async fn test_delete_rejects_missing_and_non_empty() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        assert!(session.delete("/nope").await.unwrap_err().is_no_node());
        service.put("/macondo/nodes/x", Vec::new()).unwrap();
        let err = session.delete("/macondo/nodes").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unreachable_and_bad_url() {
        let service = MemoryCoordinator::new();
        service.set_reachable(false);
        let err = service.connect(URL, timeouts()).await.unwrap_err();
        assert!(err.is_retryable());

        service.set_reachable(true);
        let err = service.connect("etcd://localhost:2379", timeouts()).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
        assert_eq!(service.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_session_records_timeouts() {
        let service = MemoryCoordinator::new();
        let session = service.connect(URL, timeouts()).await.unwrap();
        assert_eq!(
            service.session_timeout(session.id()),
            Some(Duration::from_secs(10))
        );
    }
}
