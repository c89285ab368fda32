//! Discovery configuration.
//!
//! The file format keeps every option optional so that a missing key can be
//! reported by name; [`DiscoveryConfig::validate`] turns it into the settings
//! the runtime uses.

use std::path::Path;
use std::time::Duration;

use coordination::{ClientConfig, RegistryLayout, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DiscoveryError, DiscoveryResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub coordination: CoordinationSection,
    pub service: ServiceSection,
}

/// `coordination.*` options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSection {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub retry_interval_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub session_timeout_ms: Option<u64>,
    pub registry_root: Option<String>,
    pub connect_retry_max: Option<u32>,
}

/// `service.*` options, used to build the advertised identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub id: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

/// Validated coordination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationSettings {
    pub url: String,
    pub retry_interval: Duration,
    pub connection_timeout: Duration,
    pub session_timeout: Duration,
    pub layout: RegistryLayout,
    pub connect_retry_max: Option<u32>,
}

impl CoordinationSettings {
    pub fn client_config(&self) -> ClientConfig {
        let retry = match self.connect_retry_max {
            Some(max) => RetryPolicy::bounded(self.retry_interval, max),
            None => RetryPolicy::forever(self.retry_interval),
        };
        ClientConfig {
            url: self.url.clone(),
            session_timeout: self.session_timeout,
            connection_timeout: self.connection_timeout,
            retry,
        }
    }
}

fn required_str(value: &Option<String>, key: &'static str) -> DiscoveryResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_owned()),
        _ => Err(DiscoveryError::MissingConfig(key)),
    }
}

fn required_ms(
    value: Option<u64>,
    key: &'static str,
    allow_zero: bool,
) -> DiscoveryResult<Duration> {
    match value {
        None => Err(DiscoveryError::MissingConfig(key)),
        Some(0) if !allow_zero => Err(DiscoveryError::InvalidConfig(format!(
            "{key} must be greater than zero"
        ))),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

impl DiscoveryConfig {
    /// Decode the config first as JSON, then YAML, erroring if neither works.
    pub fn parse_str<S: AsRef<str>>(input: S) -> DiscoveryResult<Self> {
        let input = input.as_ref();
        let config = match serde_json::from_str::<Self>(input) {
            Ok(config) => config,
            Err(json_err) => serde_yaml::from_str::<Self>(input).map_err(|yaml_err| {
                DiscoveryError::InvalidConfig(format!(
                    "config is neither valid JSON ({json_err}) nor YAML ({yaml_err})"
                ))
            })?,
        };
        debug!(?config);
        Ok(config)
    }

    pub fn parse<P: AsRef<Path>>(path: P) -> DiscoveryResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::InvalidConfig(format!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        })?;
        Self::parse_str(input)
    }

    /// Coordination is off unless `coordination.enabled` is set to true.
    pub fn is_enabled(&self) -> bool {
        self.coordination.enabled.unwrap_or(false)
    }

    /// Check every required option, in order, without touching the network.
    pub fn validate(&self) -> DiscoveryResult<CoordinationSettings> {
        let c = &self.coordination;
        let url = required_str(&c.url, "coordination.url")?;
        let retry_interval = required_ms(c.retry_interval_ms, "coordination.retry_interval_ms", true)?;
        let connection_timeout = required_ms(
            c.connection_timeout_ms,
            "coordination.connection_timeout_ms",
            false,
        )?;
        let session_timeout =
            required_ms(c.session_timeout_ms, "coordination.session_timeout_ms", false)?;
        let root = required_str(&c.registry_root, "coordination.registry_root")?;
        let layout =
            RegistryLayout::new(root).map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;
        if c.connect_retry_max == Some(0) {
            return Err(DiscoveryError::InvalidConfig(
                "coordination.connect_retry_max must be greater than zero".into(),
            ));
        }
        Ok(CoordinationSettings {
            url,
            retry_interval,
            connection_timeout,
            session_timeout,
            layout,
            connect_retry_max: c.connect_retry_max,
        })
    }
}
