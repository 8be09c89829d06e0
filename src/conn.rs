//! Transport seams consumed by the relay core.
//!
//! The proxy's framed transports (the player-facing connection and the
//! downstream connection) are external collaborators; the core talks to
//! them through the [`ClientConn`] and [`ServerConn`] traits and obtains
//! replacement downstreams through [`Dialer`]. Implementations own all
//! socket, batching, and compression concerns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::{Packet, Protocol};

/// One item read from the downstream. The downstream may deliver proxy
/// control packets, packets its transport already decoded, or raw frames
/// it chose to pass through; the relay dispatches on the variant.
pub enum ServerPacket {
    /// Request to flush the client's outbound buffer now.
    Flush,
    /// Authoritative latency value to publish on the session. Also the
    /// shape the proxy reports back to the downstream.
    Latency { latency: i64, timestamp: i64 },
    /// Request to swap the downstream to `addr`.
    Transfer { addr: String },
    /// Replace the session cache blob.
    UpdateCache { blob: Vec<u8> },
    /// A decoded game packet.
    Packet(Box<dyn Packet>),
    /// A raw game frame passed through undecoded.
    Raw(Vec<u8>),
}

impl std::fmt::Debug for ServerPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerPacket::Flush => write!(f, "Flush"),
            ServerPacket::Latency { latency, timestamp } => f
                .debug_struct("Latency")
                .field("latency", latency)
                .field("timestamp", timestamp)
                .finish(),
            ServerPacket::Transfer { addr } => {
                f.debug_struct("Transfer").field("addr", addr).finish()
            }
            ServerPacket::UpdateCache { blob } => f
                .debug_struct("UpdateCache")
                .field("len", &blob.len())
                .finish(),
            ServerPacket::Packet(pk) => f.debug_tuple("Packet").field(&pk.id()).finish(),
            ServerPacket::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
        }
    }
}

/// Control packet written by the proxy to the downstream. Of the control
/// set only the latency report originates on the proxy side; the rest are
/// downstream requests and arrive as [`ServerPacket`] variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPacket {
    Latency { latency: i64, timestamp: i64 },
}

/// A single item of the client's creative/registry item table. Only the
/// fields the core needs are carried.
#[derive(Clone, Debug)]
pub struct ItemEntry {
    pub name: String,
    pub runtime_id: i16,
}

/// Game data negotiated for the client during login. The core captures the
/// shield item's runtime id from it; processors receive the whole record
/// once at session start.
#[derive(Clone, Debug, Default)]
pub struct GameData {
    pub items: Vec<ItemEntry>,
}

/// The player-facing connection, pinned for the life of the session.
#[async_trait]
pub trait ClientConn: Send + Sync {
    /// Read the next batch of raw framed payloads, in arrival order.
    async fn read_batch_bytes(&self) -> Result<Vec<Vec<u8>>>;

    /// Queue raw bytes for the client.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Queue a decoded packet for the client.
    async fn write_packet(&self, pk: &dyn Packet) -> Result<()>;

    /// Flush the outbound buffer now.
    async fn flush(&self) -> Result<()>;

    /// The client's measured half round-trip latency.
    fn latency(&self) -> Duration;

    /// The protocol revision this client speaks.
    fn proto(&self) -> Arc<dyn Protocol>;

    fn game_data(&self) -> GameData;

    fn close_with_error(&self, cause: &str);
}

/// The currently selected downstream connection. Replaced wholesale on
/// transfer or fallback; implementations must tolerate `close_with_error`
/// racing in-flight reads.
#[async_trait]
pub trait ServerConn: Send + Sync {
    /// Read one item from the downstream.
    async fn read_packet(&self) -> Result<ServerPacket>;

    /// Write one control packet to the downstream.
    async fn write_packet(&self, pk: ControlPacket) -> Result<()>;

    /// Write an ordered batch of raw payloads in a single transport unit.
    async fn write_batch(&self, payloads: Vec<Vec<u8>>) -> Result<()>;

    fn close_with_error(&self, cause: &str);
}

/// Establishes downstream connections for transfer and fallback. Login and
/// server discovery live behind this seam.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn ServerConn>>;
}
