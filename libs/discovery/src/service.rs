//! Discovery lifecycle.
//!
//! `start` connects, publishes this instance and starts the membership watch;
//! `stop` reverses it. In between, a session monitor turns session state
//! changes into facade transitions and hands session loss to the
//! [`ReconnectSupervisor`].
//!
//! ```text
//! Stopped -> Initializing -> Registered <-> Suspended
//!                  |              |             |
//!                  +-> Stopped    +-> Stopped <-+
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use coordination::{
    CoordinationBackend, CoordinationClient, CoordinationError, RegistryKey, RegistryLayout,
    ServerInfo, SessionState,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::metrics;
use crate::reconnect::{Reconnect, ReconnectSupervisor};
use crate::registrar::EphemeralRegistrar;
use crate::watcher::{MembershipEvent, MembershipSnapshot, MembershipWatcher};

/// Facade lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryState {
    Stopped,
    Initializing,
    Registered,
    Suspended,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::Stopped => write!(f, "stopped"),
            DiscoveryState::Initializing => write!(f, "initializing"),
            DiscoveryState::Registered => write!(f, "registered"),
            DiscoveryState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Service discovery as seen by the hosting application.
#[async_trait]
pub trait DiscoveryService: Send + Sync + fmt::Debug {
    /// Connect, register and start watching. Fails fast on bad config.
    async fn start(&self) -> DiscoveryResult<()>;

    /// Unregister and disconnect. Never fails.
    async fn stop(&self);

    /// Application-ready hook.
    async fn on_ready(&self) {}

    /// Registered peers, excluding this instance.
    fn other_servers(&self) -> MembershipSnapshot;

    fn state(&self) -> DiscoveryState;
}

/// Build the discovery service described by `config`.
pub fn from_config(
    config: DiscoveryConfig,
    backend: Arc<dyn CoordinationBackend>,
) -> Arc<dyn DiscoveryService> {
    if !config.is_enabled() {
        return Arc::new(DisabledDiscovery);
    }
    let identity = Arc::new(StaticIdentity::from_config(&config.service));
    Arc::new(CoordinatedDiscovery::new(config, backend, identity))
}

// ---------------------------------------------------------------------------
// Disabled mode
// ---------------------------------------------------------------------------

/// Used when coordination is administratively disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledDiscovery;

#[async_trait]
impl DiscoveryService for DisabledDiscovery {
    async fn start(&self) -> DiscoveryResult<()> {
        info!("coordination disabled, discovery not started");
        Ok(())
    }

    async fn stop(&self) {}

    fn other_servers(&self) -> MembershipSnapshot {
        MembershipSnapshot::new()
    }

    fn state(&self) -> DiscoveryState {
        DiscoveryState::Stopped
    }
}

// ---------------------------------------------------------------------------
// Coordinated mode
// ---------------------------------------------------------------------------

/// Everything bound to one started lifecycle.
#[derive(Debug)]
struct Core {
    client: CoordinationClient,
    registrar: Arc<EphemeralRegistrar>,
    watcher: MembershipWatcher,
    server: ServerInfo,
    state: Arc<watch::Sender<DiscoveryState>>,
}

impl Core {
    fn is_stopped(&self) -> bool {
        *self.state.borrow() == DiscoveryState::Stopped
    }

    fn transition(&self, from: DiscoveryState, to: DiscoveryState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(%from, %to, "discovery state changed");
        }
        changed
    }
}

#[async_trait]
impl Reconnect for Core {
    async fn reconnect(&self) -> DiscoveryResult<()> {
        if self.is_stopped() {
            debug!("discovery stopped, skipping session rebuild");
            return Ok(());
        }
        info!("rebuilding coordination session");
        self.watcher.stop();
        self.client.disconnect().await;
        self.client.connect().await?;
        let outcome = self.registrar.publish(&self.server).await?;
        self.watcher.start().await?;
        self.transition(DiscoveryState::Suspended, DiscoveryState::Registered);
        info!(key = %outcome.key(), "registration restored after session loss");
        Ok(())
    }
}

#[derive(Debug)]
struct Running {
    core: Arc<Core>,
    supervisor: Arc<ReconnectSupervisor>,
    monitor: JoinHandle<()>,
}

/// Discovery backed by a coordination service.
#[derive(Debug)]
pub struct CoordinatedDiscovery {
    config: DiscoveryConfig,
    backend: Arc<dyn CoordinationBackend>,
    identity: Arc<dyn IdentityProvider>,
    state: Arc<watch::Sender<DiscoveryState>>,
    /// Client of a start that has not finished yet, so stop can cancel it.
    pending: Mutex<Option<CoordinationClient>>,
    running: Mutex<Option<Running>>,
}

impl CoordinatedDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        backend: Arc<dyn CoordinationBackend>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Stopped);
        Self {
            config,
            backend,
            identity,
            state: Arc::new(state),
            pending: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Membership changes of the current lifecycle, if started.
    pub fn subscribe_membership(&self) -> Option<broadcast::Receiver<MembershipEvent>> {
        self.core().map(|core| core.watcher.subscribe())
    }

    /// Key currently holding this instance's registration.
    pub fn registered_key(&self) -> Option<RegistryKey> {
        self.core().and_then(|core| core.registrar.tracked_key())
    }

    /// Returns true while a session rebuild is queued or running.
    pub fn reconnect_in_progress(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.supervisor.in_progress())
    }

    fn core(&self) -> Option<Arc<Core>> {
        self.running
            .lock()
            .as_ref()
            .map(|running| Arc::clone(&running.core))
    }

    async fn bring_up(
        &self,
        client: CoordinationClient,
        layout: RegistryLayout,
    ) -> DiscoveryResult<Running> {
        let server = self.identity.server_info();
        let registrar = Arc::new(EphemeralRegistrar::new(client.clone(), layout.clone()));
        let watcher = MembershipWatcher::new(
            client.clone(),
            Arc::clone(&registrar),
            layout,
            server.clone(),
            self.state.subscribe(),
        );
        let session_changes = client.subscribe();

        let result = async {
            client.connect().await?;
            registrar.publish(&server).await?;
            watcher.start().await?;
            Ok::<_, DiscoveryError>(())
        }
        .await;
        if let Err(e) = result {
            watcher.stop();
            client.close().await;
            return Err(e);
        }

        let core = Arc::new(Core {
            client,
            registrar,
            watcher,
            server,
            state: Arc::clone(&self.state),
        });
        let supervisor = Arc::new(ReconnectSupervisor::spawn(core.clone()));
        let monitor = tokio::spawn(monitor_session(
            Arc::clone(&core),
            Arc::clone(&supervisor),
            session_changes,
        ));
        Ok(Running {
            core,
            supervisor,
            monitor,
        })
    }

    async fn tear_down(running: Running) {
        let Running {
            core,
            supervisor,
            monitor,
        } = running;
        core.client.cancel();
        supervisor.shutdown().await;
        if let Err(e) = core.registrar.unpublish().await {
            warn!(error = %e, "failed to remove registration during shutdown");
        }
        core.watcher.stop();
        monitor.abort();
        core.client.close().await;
        metrics::DISCOVERY_SESSION_CONNECTED.set(0);
    }
}

#[async_trait]
impl DiscoveryService for CoordinatedDiscovery {
    async fn start(&self) -> DiscoveryResult<()> {
        if *self.state.borrow() != DiscoveryState::Stopped {
            return Err(DiscoveryError::AlreadyStarted);
        }
        let settings = self.config.validate().inspect_err(|e| {
            error!(error = %e, "discovery configuration rejected");
        })?;
        let claimed = self.state.send_if_modified(|state| {
            if *state == DiscoveryState::Stopped {
                *state = DiscoveryState::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(DiscoveryError::AlreadyStarted);
        }

        info!(
            url = %settings.url,
            registry_root = settings.layout.root(),
            server = %self.identity.server_info(),
            "starting discovery"
        );
        let client = CoordinationClient::new(Arc::clone(&self.backend), settings.client_config());
        *self.pending.lock() = Some(client.clone());
        let result = self.bring_up(client, settings.layout).await;
        self.pending.lock().take();

        let running = match result {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "discovery startup failed");
                self.state.send_replace(DiscoveryState::Stopped);
                return Err(e);
            }
        };
        let key = running.core.registrar.tracked_key();
        // stop() takes `running` after publishing Stopped, so the transition and
        // the store must happen under the same lock
        let abandoned = {
            let mut slot = self.running.lock();
            let registered = self.state.send_if_modified(|state| {
                if *state == DiscoveryState::Initializing {
                    *state = DiscoveryState::Registered;
                    true
                } else {
                    false
                }
            });
            if registered {
                *slot = Some(running);
                metrics::DISCOVERY_SESSION_CONNECTED.set(1);
                None
            } else {
                Some(running)
            }
        };
        if let Some(running) = abandoned {
            // stopped while starting
            Self::tear_down(running).await;
            return Err(DiscoveryError::Coordination(CoordinationError::Cancelled(
                "discovery stopped during startup".into(),
            )));
        }
        info!(key = ?key.as_ref().map(RegistryKey::path), "discovery registered");
        Ok(())
    }

    async fn stop(&self) {
        let previous = self.state.send_replace(DiscoveryState::Stopped);
        if let Some(client) = self.pending.lock().as_ref() {
            client.cancel();
        }
        let running = self.running.lock().take();
        let Some(running) = running else {
            debug!(%previous, "discovery not running, nothing to stop");
            return;
        };
        info!(%previous, "stopping discovery");
        Self::tear_down(running).await;
        info!("discovery stopped");
    }

    async fn on_ready(&self) {
        if *self.state.borrow() == DiscoveryState::Stopped {
            debug!("discovery stopped, ignoring ready hook");
            return;
        }
        let Some(core) = self.core() else { return };
        if !core.client.is_connected().await {
            debug!("coordination session not connected, ignoring ready hook");
            return;
        }
        match core.registrar.publish(&core.server).await {
            Ok(outcome) => debug!(key = %outcome.key(), created = outcome.is_created(), "registration checked"),
            Err(e) => warn!(error = %e, "failed to refresh registration"),
        }
        let peers = core.watcher.other_servers();
        info!(
            peers = peers.len(),
            members = ?peers.values().map(ToString::to_string).collect::<Vec<_>>(),
            "discovery ready"
        );
    }

    fn other_servers(&self) -> MembershipSnapshot {
        self.core()
            .map(|core| core.watcher.other_servers())
            .unwrap_or_default()
    }

    fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }
}

/// Turn session state changes into facade transitions.
async fn monitor_session(
    core: Arc<Core>,
    supervisor: Arc<ReconnectSupervisor>,
    mut changes: broadcast::Receiver<SessionState>,
) {
    loop {
        let state = match changes.recv().await {
            Ok(state) => state,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session state notifications lagged");
                core.client.state().await
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if core.is_stopped() {
            break;
        }
        metrics::DISCOVERY_SESSION_CONNECTED.set(i64::from(state.is_connected()));

        match state {
            SessionState::Suspended => {
                core.transition(DiscoveryState::Registered, DiscoveryState::Suspended);
                warn!("coordination session suspended, pausing membership updates");
            }
            SessionState::Lost => {
                core.transition(DiscoveryState::Registered, DiscoveryState::Suspended);
                warn!("coordination session lost, scheduling rebuild");
                supervisor.notify_lost();
            }
            SessionState::Connected => {
                if supervisor.in_progress() {
                    continue;
                }
                if core.transition(DiscoveryState::Suspended, DiscoveryState::Registered) {
                    info!("coordination session resumed");
                    // a removal of our key may have been among the dropped updates
                    match core.registrar.publish(&core.server).await {
                        Ok(outcome) if outcome.is_created() => {
                            metrics::DISCOVERY_SELF_HEALS.inc();
                            warn!(key = %outcome.key(), "registration missing after resume, re-published");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "failed to verify registration after resume"),
                    }
                    // updates were dropped while suspended
                    if let Err(e) = core.watcher.start().await {
                        warn!(error = %e, "failed to restart membership watch after resume");
                    }
                }
            }
            SessionState::Disconnected | SessionState::Connecting => {}
        }
    }
    debug!("session monitor stopped");
}

#[cfg(test)]
mod tests {
    use coordination::MemoryCoordinator;

    use super::*;
    use crate::config::{CoordinationSection, ServiceSection};

    fn enabled_config() -> DiscoveryConfig {
        DiscoveryConfig {
            coordination: CoordinationSection {
                enabled: Some(true),
                url: Some("memory://test".into()),
                retry_interval_ms: Some(10),
                connection_timeout_ms: Some(1000),
                session_timeout_ms: Some(10_000),
                registry_root: Some("/macondo".into()),
                connect_retry_max: Some(2),
            },
            service: ServiceSection {
                id: Some("host-1".into()),
                ip: Some("10.0.0.5".into()),
                port: Some(8080),
            },
        }
    }

    #[tokio::test]
    async fn test_disabled_when_not_enabled() {
        let service = MemoryCoordinator::new();
        let mut config = enabled_config();
        config.coordination.enabled = None;
        let discovery = from_config(config, Arc::new(service.clone()));
        discovery.start().await.unwrap();
        discovery.on_ready().await;
        assert_eq!(discovery.state(), DiscoveryState::Stopped);
        assert!(discovery.other_servers().is_empty());
        discovery.stop().await;
        assert_eq!(service.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let service = MemoryCoordinator::new();
        let discovery = from_config(enabled_config(), Arc::new(service.clone()));
        discovery.start().await.unwrap();
        assert_eq!(discovery.state(), DiscoveryState::Registered);
        assert_eq!(service.children("/macondo/nodes").len(), 1);

        discovery.stop().await;
        assert_eq!(discovery.state(), DiscoveryState::Stopped);
        assert!(service.children("/macondo/nodes").is_empty());
        assert!(service.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let service = MemoryCoordinator::new();
        let discovery = from_config(enabled_config(), Arc::new(service.clone()));
        discovery.start().await.unwrap();
        assert!(matches!(
            discovery.start().await,
            Err(DiscoveryError::AlreadyStarted)
        ));
        assert_eq!(service.children("/macondo/nodes").len(), 1);
        discovery.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let service = MemoryCoordinator::new();
        let discovery = from_config(enabled_config(), Arc::new(service.clone()));
        discovery.start().await.unwrap();
        discovery.stop().await;
        discovery.start().await.unwrap();
        assert_eq!(
            service.children("/macondo/nodes"),
            vec!["/macondo/nodes/0000000002".to_owned()]
        );
        discovery.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_service_is_fatal() {
        let service = MemoryCoordinator::new();
        service.set_reachable(false);
        let discovery = from_config(enabled_config(), Arc::new(service.clone()));
        let err = discovery.start().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Coordination(_)));
        assert_eq!(discovery.state(), DiscoveryState::Stopped);
        assert_eq!(service.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_on_ready_is_idempotent() {
        let service = MemoryCoordinator::new();
        let discovery = from_config(enabled_config(), Arc::new(service.clone()));
        discovery.start().await.unwrap();
        discovery.on_ready().await;
        discovery.on_ready().await;
        assert_eq!(service.children("/macondo/nodes").len(), 1);
        discovery.stop().await;
        discovery.on_ready().await;
        assert!(service.children("/macondo/nodes").is_empty());
    }
}
