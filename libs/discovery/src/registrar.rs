//! Owns this instance's registry key.
//!
//! At most one key is tracked at a time. Publish and unpublish are serialized
//! by an async mutex held across the coordination round trips.

use coordination::{
    CoordinationClient, CoordinationError, RegistryKey, RegistryLayout, ServerInfo,
    decode_server_info, encode_server_info,
};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DiscoveryResult;
use crate::metrics;

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The tracked key already holds this identity; nothing was written.
    Unchanged(RegistryKey),
    /// A new key was created and is now tracked.
    Created(RegistryKey),
}

impl PublishOutcome {
    pub fn key(&self) -> &RegistryKey {
        match self {
            PublishOutcome::Unchanged(key) | PublishOutcome::Created(key) => key,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, PublishOutcome::Created(_))
    }
}

#[derive(Debug)]
pub struct EphemeralRegistrar {
    client: CoordinationClient,
    layout: RegistryLayout,
    current: Mutex<Option<RegistryKey>>,
    /// Copy of `current` for synchronous readers; written under `current`.
    tracked: RwLock<Option<RegistryKey>>,
}

impl EphemeralRegistrar {
    pub fn new(client: CoordinationClient, layout: RegistryLayout) -> Self {
        Self {
            client,
            layout,
            current: Mutex::new(None),
            tracked: RwLock::new(None),
        }
    }

    /// Make sure exactly one key holds `info`, creating one if needed.
    pub async fn publish(&self, info: &ServerInfo) -> DiscoveryResult<PublishOutcome> {
        let mut current = self.current.lock().await;
        let result = self.publish_locked(&mut current, info).await;
        match &result {
            Ok(PublishOutcome::Created(_)) => metrics::DISCOVERY_PUBLISHES.inc(),
            Ok(PublishOutcome::Unchanged(_)) => metrics::DISCOVERY_PUBLISH_NOOPS.inc(),
            Err(_) => metrics::DISCOVERY_PUBLISH_ERRORS.inc(),
        }
        result
    }

    async fn publish_locked(
        &self,
        current: &mut Option<RegistryKey>,
        info: &ServerInfo,
    ) -> DiscoveryResult<PublishOutcome> {
        if let Some(key) = current.clone() {
            match self.client.read(key.path()).await {
                Ok(data) => match decode_server_info(&data) {
                    Ok(stored) if stored == *info => {
                        debug!(key = %key, "registration unchanged");
                        return Ok(PublishOutcome::Unchanged(key));
                    }
                    Ok(stored) => {
                        info!(key = %key, %stored, server = %info, "registration payload changed, replacing key");
                        self.delete_stale(&key).await;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "stored registration unreadable, replacing key");
                        self.delete_stale(&key).await;
                    }
                },
                Err(e) if e.is_no_node() => {
                    debug!(key = %key, "tracked registration is gone");
                }
                Err(e) => return Err(e.into()),
            }
            self.track(current, None);
        }

        let payload = encode_server_info(info)?;
        let key = self
            .client
            .create_ephemeral(&self.layout.node_prefix(), payload)
            .await?;
        info!(key = %key, server = %info, "published registration");
        self.track(current, Some(key.clone()));
        Ok(PublishOutcome::Created(key))
    }

    async fn delete_stale(&self, key: &RegistryKey) {
        match self.client.delete(key.path()).await {
            Ok(()) => debug!(key = %key, "deleted stale registration"),
            Err(e) if e.is_no_node() => {}
            Err(e) => warn!(key = %key, error = %e, "failed to delete stale registration"),
        }
    }

    /// Delete the tracked key. A key that is already gone is not an error.
    pub async fn unpublish(&self) -> DiscoveryResult<()> {
        let mut current = self.current.lock().await;
        let Some(key) = current.clone() else {
            debug!("nothing to unpublish");
            return Ok(());
        };
        self.track(&mut current, None);
        match self.client.delete(key.path()).await {
            Ok(()) => {
                info!(key = %key, "unpublished registration");
                Ok(())
            }
            Err(e) if e.is_no_node() || matches!(e, CoordinationError::SessionExpired(_)) => {
                debug!(key = %key, "registration already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The tracked key, waiting for any publish in flight.
    pub async fn current_key(&self) -> Option<RegistryKey> {
        self.current.lock().await.clone()
    }

    /// The tracked key as of the last completed publish/unpublish.
    pub fn tracked_key(&self) -> Option<RegistryKey> {
        self.tracked.read().clone()
    }

    fn track(&self, current: &mut Option<RegistryKey>, key: Option<RegistryKey>) {
        *self.tracked.write() = key.clone();
        *current = key;
    }
}
