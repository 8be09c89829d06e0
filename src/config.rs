use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::PacketId;

/// Per-session relay options. Embedders typically deserialize this from
/// their proxy configuration and hand it to [`Session::spawn`].
///
/// [`Session::spawn`]: crate::session::Session::spawn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// When true, the downstream speaks the client's exact protocol
    /// revision and client payloads pass through without an upgrade step.
    /// When false, the downstream is assumed to be on the latest revision
    /// and packets from older clients are decoded and upgraded.
    pub sync_protocol: bool,

    /// Packet ids that are always decoded on the client→server path,
    /// regardless of protocol revisions. Used by embedders whose
    /// processors need to inspect specific packets.
    pub client_decode: Vec<PacketId>,

    /// Interval between latency reports pushed to the downstream.
    pub latency_interval: Duration,

    /// Downstream addresses tried in order when the current server fails.
    pub fallback_addrs: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_protocol: false,
            client_decode: Vec::new(),
            latency_interval: Duration::from_secs(1),
            fallback_addrs: Vec::new(),
        }
    }
}
