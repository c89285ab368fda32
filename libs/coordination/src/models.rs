//! Typed models and codecs for registry payloads.
//!
//! The payload stored in each registry key is a versioned JSON object with an
//! explicit field layout, so instances written in any language can decode
//! their peers:
//!
//! ```json
//! {"version":1,"server_id":"host-1","ip":"10.0.0.5","port":8080}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Current payload layout version.
pub const PAYLOAD_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Server info
// ---------------------------------------------------------------------------

/// Identity and address of one registered instance.
///
/// Immutable once constructed; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerInfo {
    server_id: String,
    ip: String,
    port: u16,
}

impl ServerInfo {
    pub fn new(server_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            server_id: server_id.into(),
            ip: ip.into(),
            port,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.server_id, self.ip, self.port)
    }
}

// ---------------------------------------------------------------------------
// Registry key
// ---------------------------------------------------------------------------

/// Path of an ephemeral, sequentially-named key assigned by the coordination
/// service at creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistryKey(String);

impl RegistryKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// The final path segment, i.e. the sequence suffix for sequential keys.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RegistryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PayloadRef<'a> {
    version: u32,
    #[serde(flatten)]
    server: &'a ServerInfo,
}

#[derive(Deserialize)]
struct Payload {
    version: u32,
    #[serde(flatten)]
    server: ServerInfo,
}

/// Encode a `ServerInfo` into the versioned registry payload.
pub fn encode_server_info(info: &ServerInfo) -> CoordinationResult<Vec<u8>> {
    encode(&PayloadRef {
        version: PAYLOAD_VERSION,
        server: info,
    })
}

/// Decode a registry payload, rejecting versions this build does not know.
pub fn decode_server_info(data: &[u8]) -> CoordinationResult<ServerInfo> {
    let payload: Payload = decode(data)?;
    if payload.version != PAYLOAD_VERSION {
        return Err(CoordinationError::Codec(format!(
            "unsupported payload version {} (expected {PAYLOAD_VERSION})",
            payload.version
        )));
    }
    Ok(payload.server)
}

/// Encode a model value to JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> CoordinationResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CoordinationError::Codec(e.to_string()))
}

/// Decode JSON bytes into a typed model.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> CoordinationResult<T> {
    serde_json::from_slice(data).map_err(|e| CoordinationError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
