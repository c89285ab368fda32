//! # coordination
//!
//! Session-scoped client for ZooKeeper-like coordination services.
//!
//! This library provides:
//! - **Session client** with fixed-interval connect retry, cancellation, and
//!   session state observability (`Connected`, `Suspended`, `Lost`, ...).
//! - **Backend contract** (`CoordinationBackend`/`Session`) describing
//!   ephemeral and sequential keys plus child watches.
//! - **In-memory service** with operator controls for tests and single-host
//!   development.
//! - **etcd service** (feature `etcd`) mapping sessions onto leases.
//! - **Registry payload codec** and **layout resolver** shared by every
//!   instance of the registry.
//!
//! ## Design Principles
//!
//! - Consumers only see typed errors and enumerated session states, never
//!   backend internals.
//! - No hard-coded registry paths in runtime code.
//! - The registry payload is a versioned, language-neutral JSON layout.

pub mod backend;
pub mod client;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod layout;
pub mod memory;
pub mod models;

// Re-export key types for convenient access
pub use backend::{
    CoordinationBackend, CreateMode, Session, SessionId, SessionTimeouts, WatchEvent,
    WatchEventKind, WatchStream,
};
pub use client::{ClientConfig, CoordinationClient, RetryPolicy, SessionState};
pub use error::{CoordinationError, CoordinationResult};
#[cfg(feature = "etcd")]
pub use etcd::{ETCD_SCHEME, EtcdBackend};
pub use layout::{DEFAULT_REGISTRY_ROOT, RegistryLayout};
pub use memory::{MEMORY_SCHEME, MemoryCoordinator};
pub use models::{RegistryKey, ServerInfo, decode_server_info, encode_server_info};
