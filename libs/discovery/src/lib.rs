//! # discovery
//!
//! Self-registration and membership tracking for a fleet of identical
//! instances sharing a coordination service.
//!
//! Each instance advertises itself under an ephemeral, sequentially-named key
//! and watches its peers' keys:
//! - [`EphemeralRegistrar`] keeps exactly one key holding this instance's
//!   [`ServerInfo`](coordination::ServerInfo).
//! - [`MembershipWatcher`] mirrors the peer keys into a local cache and
//!   re-publishes when our own key disappears.
//! - [`ReconnectSupervisor`] rebuilds the session after it is lost, one
//!   rebuild at a time.
//! - [`CoordinatedDiscovery`] ties them to a start/stop lifecycle;
//!   [`DisabledDiscovery`] stands in when coordination is turned off.

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod reconnect;
pub mod registrar;
pub mod service;
pub mod watcher;

pub use config::{CoordinationSettings, DiscoveryConfig};
pub use error::{DiscoveryError, DiscoveryResult};
pub use identity::{IdentityProvider, StaticIdentity};
pub use reconnect::{Reconnect, ReconnectSupervisor};
pub use registrar::{EphemeralRegistrar, PublishOutcome};
pub use service::{
    CoordinatedDiscovery, DisabledDiscovery, DiscoveryService, DiscoveryState, from_config,
};
pub use watcher::{MembershipEvent, MembershipSnapshot, MembershipWatcher};
