//! Who this instance is, as advertised in the registry.

use std::fmt;

use coordination::ServerInfo;
use rand::{Rng, distributions::Alphanumeric};

use crate::config::ServiceSection;

const DEFAULT_IP: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 0;
const RANDOM_ID_LEN: usize = 10;

/// Supplies the identity published by the registrar.
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    fn server_id(&self) -> String;

    fn server_info(&self) -> ServerInfo;
}

/// Fixed identity, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    info: ServerInfo,
}

impl StaticIdentity {
    pub fn new(info: ServerInfo) -> Self {
        Self { info }
    }

    /// Build from `service.*`. A missing id falls back to `HOSTNAME`, then to a
    /// random alphanumeric id.
    pub fn from_config(service: &ServiceSection) -> Self {
        let server_id = non_blank(service.id.as_deref())
            .map(str::to_owned)
            .unwrap_or_else(fallback_server_id);
        let ip = non_blank(service.ip.as_deref()).unwrap_or(DEFAULT_IP);
        let port = service.port.unwrap_or(DEFAULT_PORT);
        Self::new(ServerInfo::new(server_id, ip, port))
    }
}

impl IdentityProvider for StaticIdentity {
    fn server_id(&self) -> String {
        self.info.server_id().to_owned()
    }

    fn server_info(&self) -> ServerInfo {
        self.info.clone()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn fallback_server_id() -> String {
    env_parser::non_blank_var("HOSTNAME").unwrap_or_else(random_id)
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_ID_LEN)
        .map(char::from)
        .collect()
}
