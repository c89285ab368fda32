//! Coordination service contract.
//!
//! `CoordinationBackend` and `Session` describe what this crate expects from a
//! ZooKeeper-like store: sessions whose loss removes their ephemeral keys,
//! sequentially-named keys, and child-change notifications. The client in
//! [`crate::client`] is written purely against these traits; concrete
//! services live in [`crate::memory`] and, with the `etcd` feature,
//! `crate::etcd`.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::client::SessionState;
use crate::error::CoordinationResult;

/// Width of the sequence suffix appended to sequential keys.
pub const SEQUENCE_WIDTH: usize = 10;

/// Identifier of one session, unique per backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Timeouts negotiated when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// How long the service keeps the session alive without hearing from us.
    pub session: Duration,
    /// Upper bound for establishing the connection.
    pub connection: Duration,
}

/// How a key is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Outlives the session.
    Persistent,
    /// Removed by the service when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a service-assigned sequence appended to the path.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Kind of child change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Added,
    Updated,
    Removed,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEventKind::Added => write!(f, "added"),
            WatchEventKind::Updated => write!(f, "updated"),
            WatchEventKind::Removed => write!(f, "removed"),
        }
    }
}

/// A change to one child of a watched path.
///
/// `data` carries the child's payload: the new value for `Added`/`Updated`
/// and the last known value for `Removed`, when the service provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
    pub data: Option<Vec<u8>>,
}

impl WatchEvent {
    pub fn added(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: WatchEventKind::Added,
            path: path.into(),
            data: Some(data),
        }
    }

    pub fn updated(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: WatchEventKind::Updated,
            path: path.into(),
            data: Some(data),
        }
    }

    pub fn removed(path: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: WatchEventKind::Removed,
            path: path.into(),
            data,
        }
    }
}

/// Stream of child changes. Ends when the owning session goes away.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Entry point into a coordination service.
#[async_trait]
pub trait CoordinationBackend: Send + Sync + fmt::Debug + 'static {
    /// Open a new session. Returns once the session is `Connected`.
    async fn connect(
        &self,
        url: &str,
        timeouts: SessionTimeouts,
    ) -> CoordinationResult<Arc<dyn Session>>;
}

/// One live session with the coordination service.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> SessionId;

    /// Current state as seen by the session.
    fn state(&self) -> SessionState;

    /// Every state transition of this session, in order.
    fn state_changes(&self) -> broadcast::Receiver<SessionState>;

    /// Create a key, creating missing parents as persistent keys.
    /// Returns the final path (with the sequence for sequential modes).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode)
    -> CoordinationResult<String>;

    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>>;

    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Watch the direct children of `parent`. Existing children are replayed
    /// as `Added` before live changes are delivered.
    async fn watch_children(&self, parent: &str) -> CoordinationResult<WatchStream>;

    /// End the session; ephemeral keys it owns are removed.
    async fn close(&self);
}

/// Parent path of `path`, or `None` for top-level keys.
pub fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 { None } else { Some(&path[..idx]) }
}

/// Final path for a sequential create.
pub fn sequential_path(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

/// Returns true if `path` is a direct child of `parent`.
pub fn is_direct_child(parent: &str, path: &str) -> bool {
    path.strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.is_empty() && !name.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/macondo/nodes/0000000001"), Some("/macondo/nodes"));
        assert_eq!(parent_of("/macondo/nodes/"), Some("/macondo/nodes"));
        assert_eq!(parent_of("/macondo"), None);
        assert_eq!(parent_of("macondo"), None);
    }

    #[test]
    fn test_sequential_path() {
        assert_eq!(
            sequential_path("/macondo/nodes/", 1),
            "/macondo/nodes/0000000001"
        );
        assert_eq!(
            sequential_path("/macondo/nodes/n-", 42),
            "/macondo/nodes/n-0000000042"
        );
    }

    #[test]
    fn test_is_direct_child() {
        assert!(is_direct_child("/macondo/nodes", "/macondo/nodes/0000000001"));
        assert!(!is_direct_child("/macondo/nodes", "/macondo/nodes"));
        assert!(!is_direct_child("/macondo/nodes", "/macondo/nodes/a/b"));
        assert!(!is_direct_child("/macondo/nodes", "/macondo/nodes2/a"));
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(!CreateMode::Ephemeral.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
    }
}
