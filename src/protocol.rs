//! Wire-codec seam between the relay core and the per-version packet
//! registries.
//!
//! The relay never interprets game packets itself; it parses the packet
//! header, looks the id up in the active [`Protocol`]'s pool, and hands the
//! body to the registry's reader/writer. Everything version-specific
//! (field layouts, the upgrade path to the latest revision) lives behind
//! the [`Protocol`] trait so the core works unchanged against any registry
//! the embedder plugs in.
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Keep the relay loops independent of any concrete game-protocol crate
//! - Let multi-version registries share the header and varint plumbing
//! - Allow tests to substitute tiny hand-built registries

use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::conn::ClientConn;

/// Numeric id of a game packet within a protocol revision.
pub type PacketId = u32;

/// Protocol id of the latest game-protocol revision the proxy targets.
/// Clients on this revision need no upgrade step.
pub const CURRENT_PROTOCOL: i32 = 827;

/// Packet ids occupy the low bits of the header value; the two sub-client
/// ids (split-screen players) sit above them.
const HEADER_ID_MASK: u32 = 0x3ff;
const HEADER_SENDER_SHIFT: u32 = 10;
const HEADER_TARGET_SHIFT: u32 = 12;
const HEADER_SUBCLIENT_MASK: u32 = 0x3;

/// Error raised when a varint runs past its maximum width or the buffer
/// ends mid-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarintError;

impl std::fmt::Display for VarintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed or truncated varint")
    }
}

impl std::error::Error for VarintError {}

pub fn read_varu32(buf: &mut Cursor<&[u8]>) -> Result<u32, VarintError> {
    let mut value: u32 = 0;
    for shift in (0..35).step_by(7) {
        let pos = buf.position() as usize;
        let byte = *buf.get_ref().get(pos).ok_or(VarintError)?;
        buf.set_position(pos as u64 + 1);
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(VarintError)
}

pub fn write_varu32(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_varu64(buf: &mut Cursor<&[u8]>) -> Result<u64, VarintError> {
    let mut value: u64 = 0;
    for shift in (0..70).step_by(7) {
        let pos = buf.position() as usize;
        let byte = *buf.get_ref().get(pos).ok_or(VarintError)?;
        buf.set_position(pos as u64 + 1);
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(VarintError)
}

pub fn write_varu64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Packet header preceding every framed payload: the packet id plus the
/// sender/target sub-client ids, packed into a single varuint32.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_id: PacketId,
    pub sender_subclient: u8,
    pub target_subclient: u8,
}

impl Header {
    pub fn read(&mut self, buf: &mut Cursor<&[u8]>) -> Result<()> {
        let value = read_varu32(buf)?;
        self.packet_id = value & HEADER_ID_MASK;
        self.sender_subclient = ((value >> HEADER_SENDER_SHIFT) & HEADER_SUBCLIENT_MASK) as u8;
        self.target_subclient = ((value >> HEADER_TARGET_SHIFT) & HEADER_SUBCLIENT_MASK) as u8;
        Ok(())
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let value = (self.packet_id & HEADER_ID_MASK)
            | (u32::from(self.sender_subclient) & HEADER_SUBCLIENT_MASK) << HEADER_SENDER_SHIFT
            | (u32::from(self.target_subclient) & HEADER_SUBCLIENT_MASK) << HEADER_TARGET_SHIFT;
        write_varu32(buf, value);
    }
}

/// Field-level reader a [`Protocol`] hands to [`Packet::decode`]. Created
/// per payload with the session's shield runtime id, which item-stack
/// codecs need to resolve shield entries.
pub trait PacketReader {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_bool(&mut self) -> Result<bool>;
    fn read_varu32(&mut self) -> Result<u32>;
    fn read_vari64(&mut self) -> Result<i64>;
    fn read_string(&mut self) -> Result<String>;
    /// Bytes left in the payload. Must be zero once a packet has fully
    /// decoded; the relay rejects the batch otherwise.
    fn remaining(&self) -> usize;
    fn shield_id(&self) -> i32;
}

/// Field-level writer counterpart of [`PacketReader`].
pub trait PacketWriter {
    fn write_u8(&mut self, v: u8);
    fn write_bool(&mut self, v: bool);
    fn write_varu32(&mut self, v: u32);
    fn write_vari64(&mut self, v: i64);
    fn write_string(&mut self, s: &str);
    fn shield_id(&self) -> i32;
}

/// A decoded game packet. `as_any`/`as_any_mut` let processors downcast to
/// the concrete type to inspect or rewrite fields.
pub trait Packet: Send + Sync {
    fn id(&self) -> PacketId;
    fn encode(&self, w: &mut dyn PacketWriter) -> Result<()>;
    fn decode(&mut self, r: &mut dyn PacketReader) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Factory producing an empty packet of one type, ready to decode into.
pub type PacketFactory = fn() -> Box<dyn Packet>;

/// Registry of the packet types one side of the connection may send.
pub type PacketPool = HashMap<PacketId, PacketFactory>;

/// One game-protocol revision: its packet registry, its field codecs, and
/// the upgrade path into the latest revision.
pub trait Protocol: Send + Sync {
    /// Numeric protocol revision id.
    fn id(&self) -> i32;

    /// Packet registry for the given direction (`from_client` selects the
    /// serverbound pool).
    fn packets(&self, from_client: bool) -> &PacketPool;

    fn new_reader<'a>(&self, buf: &'a [u8], shield_id: i32) -> Box<dyn PacketReader + 'a>;

    fn new_writer<'a>(&self, buf: &'a mut Vec<u8>, shield_id: i32) -> Box<dyn PacketWriter + 'a>;

    /// Convert a packet of this revision into its latest-revision form.
    /// May fan out into several packets or into none (the packet has no
    /// latest-revision equivalent and is dropped).
    fn convert_to_latest(
        &self,
        pk: &dyn Packet,
        conn: &dyn ClientConn,
    ) -> Vec<Box<dyn Packet>>;

    /// The latest-revision protocol this one upgrades into. A registry
    /// already on [`CURRENT_PROTOCOL`] returns itself.
    fn latest(&self) -> Arc<dyn Protocol>;
}

/// Plain byte-slice implementation of [`PacketReader`] for registries
/// without version-specific field encodings.
pub struct BytesReader<'a> {
    buf: &'a [u8],
    pos: usize,
    shield_id: i32,
}

impl<'a> BytesReader<'a> {
    pub fn new(buf: &'a [u8], shield_id: i32) -> Self {
        Self { buf, pos: 0, shield_id }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            bail!("expected {n} more bytes, have {}", self.buf.len() - self.pos);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

impl PacketReader for BytesReader<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    fn read_varu32(&mut self) -> Result<u32> {
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        let value = read_varu32(&mut cursor)?;
        self.pos += cursor.position() as usize;
        Ok(value)
    }

    fn read_vari64(&mut self) -> Result<i64> {
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        let value = read_varu64(&mut cursor)?;
        self.pos += cursor.position() as usize;
        // Zigzag decode.
        Ok((value >> 1) as i64 ^ -((value & 1) as i64))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_varu32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn shield_id(&self) -> i32 {
        self.shield_id
    }
}

/// Plain `Vec<u8>` implementation of [`PacketWriter`].
pub struct BytesWriter<'a> {
    buf: &'a mut Vec<u8>,
    shield_id: i32,
}

impl<'a> BytesWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>, shield_id: i32) -> Self {
        Self { buf, shield_id }
    }
}

impl PacketWriter for BytesWriter<'_> {
    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    fn write_varu32(&mut self, v: u32) {
        write_varu32(self.buf, v);
    }

    fn write_vari64(&mut self, v: i64) {
        // Zigzag encode.
        write_varu64(self.buf, ((v << 1) ^ (v >> 63)) as u64);
    }

    fn write_string(&mut self, s: &str) {
        write_varu32(self.buf, s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn shield_id(&self) -> i32 {
        self.shield_id
    }
}
