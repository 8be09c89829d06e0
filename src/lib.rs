mod config;
mod conn;
mod processor;
mod protocol;
mod relay;
mod session;
mod tracker;

pub use config::SessionConfig;
pub use conn::{ClientConn, ControlPacket, Dialer, GameData, ItemEntry, ServerConn, ServerPacket};
pub use processor::{Context, NopProcessor, PacketContext, Processor};
pub use protocol::{
    read_varu32, read_varu64, write_varu32, write_varu64, BytesReader, BytesWriter, Header,
    Packet, PacketFactory, PacketId, PacketPool, PacketReader, PacketWriter, Protocol,
    VarintError, CURRENT_PROTOCOL,
};
pub use session::{is_session_closed, Session, SessionClosed};
pub use tracker::{NopTracker, Tracker};
