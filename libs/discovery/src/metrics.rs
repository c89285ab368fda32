//! Discovery metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered in the default prometheus registry. Registration failures are
//! fatal (`.unwrap()`): they can only come from a duplicate metric name.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge};

lazy_static! {
    // --- registration ---

    /// Count of registry keys created
    pub static ref DISCOVERY_PUBLISHES: IntCounter = register_int_counter!(
        "discovery_publishes",
        "count of registry keys created for this instance"
    ).unwrap();

    /// Count of publish calls that found the registration already current
    pub static ref DISCOVERY_PUBLISH_NOOPS: IntCounter = register_int_counter!(
        "discovery_publish_noops",
        "count of publish calls that found an identical registration"
    ).unwrap();

    /// Count of failed publish calls
    pub static ref DISCOVERY_PUBLISH_ERRORS: IntCounter = register_int_counter!(
        "discovery_publish_errors",
        "count of failed publish attempts"
    ).unwrap();

    /// Count of re-publishes triggered by removal of our own key
    pub static ref DISCOVERY_SELF_HEALS: IntCounter = register_int_counter!(
        "discovery_self_heals",
        "count of re-publishes after the instance key was removed externally"
    ).unwrap();

    // --- session recovery ---

    pub static ref DISCOVERY_RECONNECTS: IntCounter = register_int_counter!(
        "discovery_reconnects",
        "count of completed session rebuilds"
    ).unwrap();

    pub static ref DISCOVERY_RECONNECT_ERRORS: IntCounter = register_int_counter!(
        "discovery_reconnect_errors",
        "count of session rebuilds that failed"
    ).unwrap();

    /// Loss notifications dropped because a rebuild was already running
    pub static ref DISCOVERY_RECONNECTS_COALESCED: IntCounter = register_int_counter!(
        "discovery_reconnects_coalesced",
        "count of session loss notifications coalesced into a running rebuild"
    ).unwrap();

    // --- membership ---

    pub static ref DISCOVERY_DECODE_ERRORS: IntCounter = register_int_counter!(
        "discovery_decode_errors",
        "count of peer payloads that failed to decode"
    ).unwrap();

    /// Peers currently known, excluding this instance
    pub static ref DISCOVERY_MEMBERS: IntGauge = register_int_gauge!(
        "discovery_members",
        "number of peers currently registered, excluding this instance"
    ).unwrap();

    /// 1 while the coordination session is connected, 0 otherwise
    pub static ref DISCOVERY_SESSION_CONNECTED: IntGauge = register_int_gauge!(
        "discovery_session_connected",
        "coordination session connected (1) or not (0)"
    ).unwrap();
}

/// Render the default registry in the prometheus text format.
pub fn encode_text() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buf = String::new();
    let mf = prometheus::gather();
    encoder.encode_utf8(&mf, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_text_includes_discovery_metrics() {
        DISCOVERY_PUBLISHES.inc();
        DISCOVERY_MEMBERS.get();
        let text = encode_text().unwrap();
        assert!(text.contains("# TYPE discovery_publishes counter"));
        assert!(text.contains("discovery_members"));
    }
}
