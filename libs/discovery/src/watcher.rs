//! Membership cache fed by a child watch on the registry.
//!
//! Every peer key under the nodes directory is decoded into the cache. A
//! payload that fails to decode only drops its own entry. Removal of this
//! instance's own key re-publishes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use coordination::{
    CoordinationClient, RegistryLayout, ServerInfo, WatchEvent, WatchEventKind, WatchStream,
    decode_server_info,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::DiscoveryResult;
use crate::metrics;
use crate::registrar::EphemeralRegistrar;
use crate::service::DiscoveryState;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Registry key path to decoded peer, ordered by path.
pub type MembershipSnapshot = BTreeMap<String, ServerInfo>;

/// Decoded change to the peer set. Never emitted for this instance's own key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added { path: String, server: ServerInfo },
    Updated { path: String, server: ServerInfo },
    Removed { path: String, server: Option<ServerInfo> },
}

impl MembershipEvent {
    pub fn path(&self) -> &str {
        match self {
            MembershipEvent::Added { path, .. }
            | MembershipEvent::Updated { path, .. }
            | MembershipEvent::Removed { path, .. } => path,
        }
    }
}

#[derive(Debug)]
pub struct MembershipWatcher {
    core: Arc<WatcherCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct WatcherCore {
    client: CoordinationClient,
    registrar: Arc<EphemeralRegistrar>,
    layout: RegistryLayout,
    server: ServerInfo,
    cache: RwLock<MembershipSnapshot>,
    events: broadcast::Sender<MembershipEvent>,
    lifecycle: watch::Receiver<DiscoveryState>,
}

impl MembershipWatcher {
    pub fn new(
        client: CoordinationClient,
        registrar: Arc<EphemeralRegistrar>,
        layout: RegistryLayout,
        server: ServerInfo,
        lifecycle: watch::Receiver<DiscoveryState>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            core: Arc::new(WatcherCore {
                client,
                registrar,
                layout,
                server,
                cache: RwLock::new(BTreeMap::new()),
                events,
                lifecycle,
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the child watch and start applying events. Restarts a running
    /// watch, rebuilding the cache from the replayed children.
    pub async fn start(&self) -> DiscoveryResult<()> {
        self.stop();
        let dir = self.core.layout.nodes_dir();
        let stream = self.core.client.watch_children(dir).await?;
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(core.run(stream));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(dir, "membership watch started");
        Ok(())
    }

    /// Abort the watch task and clear the cache.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("membership watch stopped");
        }
        self.core.cache.write().clear();
        metrics::DISCOVERY_MEMBERS.set(0);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Point-in-time copy of the peers, excluding this instance's key.
    pub fn other_servers(&self) -> MembershipSnapshot {
        self.core.other_servers()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.core.events.subscribe()
    }
}

impl Drop for MembershipWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl WatcherCore {
    async fn run(self: Arc<Self>, mut stream: WatchStream) {
        while let Some(event) = stream.next().await {
            self.handle(event).await;
        }
        debug!("membership watch stream ended");
    }

    async fn handle(&self, event: WatchEvent) {
        if *self.lifecycle.borrow() == DiscoveryState::Stopped {
            trace!(path = %event.path, "discovery stopped, ignoring watch event");
            return;
        }
        if !self.client.is_connected().await {
            debug!(path = %event.path, kind = %event.kind, "ignoring watch event outside a connected session");
            return;
        }
        if !self.layout.is_node(&event.path) {
            return;
        }

        let own = self.registrar.current_key().await;
        let is_own = own.as_ref().is_some_and(|key| key.path() == event.path);
        let WatchEvent { kind, path, data } = event;

        match kind {
            WatchEventKind::Removed => {
                let previous = self.cache.write().remove(&path);
                if is_own {
                    self.restore_registration(&path).await;
                } else {
                    debug!(path = %path, "peer left");
                    self.emit(MembershipEvent::Removed {
                        path,
                        server: previous,
                    });
                }
            }
            WatchEventKind::Added | WatchEventKind::Updated => {
                let Some(data) = data else {
                    trace!(path = %path, %kind, "ignoring watch event without data");
                    return;
                };
                match decode_server_info(&data) {
                    Ok(server) => {
                        let previous = self.cache.write().insert(path.clone(), server.clone());
                        if is_own || previous.as_ref() == Some(&server) {
                            self.update_gauge();
                            return;
                        }
                        debug!(path = %path, %server, "peer registered");
                        self.emit(if previous.is_some() {
                            MembershipEvent::Updated { path, server }
                        } else {
                            MembershipEvent::Added { path, server }
                        });
                    }
                    Err(e) => {
                        metrics::DISCOVERY_DECODE_ERRORS.inc();
                        warn!(path = %path, error = %e, "dropping undecodable registry entry");
                        let previous = self.cache.write().remove(&path);
                        if let (Some(server), false) = (previous, is_own) {
                            self.emit(MembershipEvent::Removed {
                                path,
                                server: Some(server),
                            });
                        }
                    }
                }
            }
        }
        self.update_gauge();
    }

    async fn restore_registration(&self, path: &str) {
        warn!(key = %path, "own registration removed externally, re-publishing");
        metrics::DISCOVERY_SELF_HEALS.inc();
        match self.registrar.publish(&self.server).await {
            Ok(outcome) => info!(key = %outcome.key(), "registration restored"),
            Err(e) => error!(error = %e, "failed to restore registration"),
        }
    }

    fn other_servers(&self) -> MembershipSnapshot {
        let own = self.registrar.tracked_key();
        self.cache
            .read()
            .iter()
            .filter(|(path, _)| own.as_ref().is_none_or(|key| key.path() != path.as_str()))
            .map(|(path, server)| (path.clone(), server.clone()))
            .collect()
    }

    fn emit(&self, event: MembershipEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn update_gauge(&self) {
        let peers = self.other_servers().len();
        metrics::DISCOVERY_MEMBERS.set(i64::try_from(peers).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coordination::{ClientConfig, MemoryCoordinator, RetryPolicy, encode_server_info};
    use tracing_test::traced_test;

    use super::*;

    struct Fixture {
        service: MemoryCoordinator,
        client: CoordinationClient,
        registrar: Arc<EphemeralRegistrar>,
        watcher: MembershipWatcher,
        lifecycle: watch::Sender<DiscoveryState>,
    }

    fn host(n: u8) -> ServerInfo {
        ServerInfo::new(format!("host-{n}"), format!("10.0.0.{n}"), 8080)
    }

    async fn fixture() -> Fixture {
        let service = MemoryCoordinator::new();
        let client = CoordinationClient::new(
            Arc::new(service.clone()),
            ClientConfig {
                url: "memory://test".into(),
                session_timeout: Duration::from_secs(10),
                connection_timeout: Duration::from_secs(1),
                retry: RetryPolicy::bounded(Duration::from_millis(10), 2),
            },
        );
        client.connect().await.unwrap();
        let layout = RegistryLayout::default();
        let registrar = Arc::new(EphemeralRegistrar::new(client.clone(), layout.clone()));
        let (lifecycle, rx) = watch::channel(DiscoveryState::Registered);
        let watcher = MembershipWatcher::new(client.clone(), registrar.clone(), layout, host(1), rx);
        Fixture {
            service,
            client,
            registrar,
            watcher,
            lifecycle,
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn peer_payload(n: u8) -> Vec<u8> {
        encode_server_info(&host(n)).unwrap()
    }

    #[tokio::test]
    async fn test_replay_and_exclusion() {
        let f = fixture().await;
        f.service.put("/macondo/nodes/0000000100", peer_payload(2)).unwrap();
        let own = f.registrar.publish(&host(1)).await.unwrap();
        f.watcher.start().await.unwrap();

        eventually(|| f.watcher.other_servers().len() == 1).await;
        let peers = f.watcher.other_servers();
        assert_eq!(peers.get("/macondo/nodes/0000000100"), Some(&host(2)));
        assert!(!peers.contains_key(own.key().path()));
        assert!(f.watcher.is_running());
    }

    #[tokio::test]
    async fn test_live_changes_are_delivered() {
        let f = fixture().await;
        let mut events = f.watcher.subscribe();
        f.watcher.start().await.unwrap();

        f.service.put("/macondo/nodes/0000000007", peer_payload(7)).unwrap();
        let added = events.recv().await.unwrap();
        assert_eq!(
            added,
            MembershipEvent::Added {
                path: "/macondo/nodes/0000000007".into(),
                server: host(7)
            }
        );

        f.service.set_data("/macondo/nodes/0000000007", peer_payload(8)).unwrap();
        let updated = events.recv().await.unwrap();
        assert!(matches!(updated, MembershipEvent::Updated { ref server, .. } if *server == host(8)));

        f.service.remove("/macondo/nodes/0000000007").unwrap();
        let removed = events.recv().await.unwrap();
        assert_eq!(
            removed,
            MembershipEvent::Removed {
                path: "/macondo/nodes/0000000007".into(),
                server: Some(host(8))
            }
        );
        assert!(f.watcher.other_servers().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_corrupt_payload_is_isolated() {
        let f = fixture().await;
        f.service.put("/macondo/nodes/0000000002", peer_payload(2)).unwrap();
        f.service.put("/macondo/nodes/0000000003", b"\xac\xed\x00\x05".to_vec()).unwrap();
        f.service.put("/macondo/nodes/0000000004", peer_payload(4)).unwrap();
        f.watcher.start().await.unwrap();

        eventually(|| f.watcher.other_servers().len() == 2).await;
        let peers = f.watcher.other_servers();
        assert_eq!(peers.get("/macondo/nodes/0000000002"), Some(&host(2)));
        assert_eq!(peers.get("/macondo/nodes/0000000004"), Some(&host(4)));
        assert!(logs_contain("dropping undecodable registry entry"));

        // a good entry turning bad is evicted
        f.service.set_data("/macondo/nodes/0000000002", b"{}".to_vec()).unwrap();
        eventually(|| f.watcher.other_servers().len() == 1).await;
        assert!(f.watcher.other_servers().contains_key("/macondo/nodes/0000000004"));
    }

    #[tokio::test]
    async fn test_own_key_removal_republishes() {
        let f = fixture().await;
        let first = f.registrar.publish(&host(1)).await.unwrap();
        f.watcher.start().await.unwrap();

        f.service.remove(first.key().path()).unwrap();
        eventually(|| {
            f.registrar
                .tracked_key()
                .is_some_and(|k| k.path() == "/macondo/nodes/0000000002")
        })
        .await;
        assert_eq!(
            f.service.children("/macondo/nodes"),
            vec!["/macondo/nodes/0000000002".to_owned()]
        );
        assert!(f.watcher.other_servers().is_empty());
    }

    #[tokio::test]
    async fn test_events_ignored_when_stopped() {
        let f = fixture().await;
        f.watcher.start().await.unwrap();
        f.lifecycle.send_replace(DiscoveryState::Stopped);
        f.service.put("/macondo/nodes/0000000009", peer_payload(9)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.watcher.other_servers().is_empty());
    }

    #[tokio::test]
    async fn test_events_ignored_while_suspended() {
        let f = fixture().await;
        let first = f.registrar.publish(&host(1)).await.unwrap();
        f.watcher.start().await.unwrap();
        let id = f.client.session_id().await.unwrap();
        let mut states = f.client.subscribe();
        f.service.suspend_session(id);
        assert_eq!(
            states.recv().await.unwrap(),
            coordination::SessionState::Suspended
        );

        // neither peers nor our own removal are acted upon
        f.service.put("/macondo/nodes/0000000009", peer_payload(9)).unwrap();
        f.service.remove(first.key().path()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.watcher.other_servers().is_empty());
        assert_eq!(f.registrar.tracked_key(), Some(first.key().clone()));
    }

    #[tokio::test]
    async fn test_stop_clears_cache() {
        let f = fixture().await;
        f.service.put("/macondo/nodes/0000000002", peer_payload(2)).unwrap();
        f.watcher.start().await.unwrap();
        eventually(|| f.watcher.other_servers().len() == 1).await;
        f.watcher.stop();
        assert!(!f.watcher.is_running());
        assert!(f.watcher.other_servers().is_empty());
    }
}
