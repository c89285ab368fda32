#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use coordination::{MemoryCoordinator, ServerInfo, SessionId};
use discovery::config::{CoordinationSection, ServiceSection};
use discovery::{CoordinatedDiscovery, DiscoveryConfig, StaticIdentity};

pub const NODES_DIR: &str = "/macondo/nodes";

const WAIT: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(5);

pub fn config() -> DiscoveryConfig {
    DiscoveryConfig {
        coordination: CoordinationSection {
            enabled: Some(true),
            url: Some("memory://cluster".into()),
            retry_interval_ms: Some(10),
            connection_timeout_ms: Some(1_000),
            session_timeout_ms: Some(10_000),
            registry_root: Some("/macondo".into()),
            connect_retry_max: None,
        },
        service: ServiceSection::default(),
    }
}

pub fn host(n: u8) -> ServerInfo {
    ServerInfo::new(format!("host-{n}"), format!("10.0.0.{}", 4 + n), 8080)
}

pub fn node(seq: u64) -> String {
    format!("{NODES_DIR}/{seq:010}")
}

pub fn instance(service: &MemoryCoordinator, info: ServerInfo) -> Arc<CoordinatedDiscovery> {
    instance_with(service, info, config())
}

pub fn instance_with(
    service: &MemoryCoordinator,
    info: ServerInfo,
    config: DiscoveryConfig,
) -> Arc<CoordinatedDiscovery> {
    Arc::new(CoordinatedDiscovery::new(
        config,
        Arc::new(service.clone()),
        Arc::new(StaticIdentity::new(info)),
    ))
}

/// Session that owns the instance's current key.
pub fn session_of(service: &MemoryCoordinator, discovery: &CoordinatedDiscovery) -> SessionId {
    let key = discovery.registered_key().expect("instance is not registered");
    service
        .ephemeral_owner(key.path())
        .expect("registered key has no owner")
}

/// Poll `check` until it holds, panicking with `what` after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}
