//! Packet interception layer.
//!
//! Every item crossing the relay is wrapped in a context and offered to
//! the session's [`Processor`] before it is forwarded. Processors cancel
//! items, rewrite decoded packets, or redirect transfers; the relay
//! enforces the resulting semantics. [`NopProcessor`] is the default so
//! embedders override only the hooks they care about.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::conn::GameData;
use crate::protocol::Packet;

/// Contexts kept in the reuse pool beyond this count are dropped instead.
const MAX_POOLED_CONTEXTS: usize = 256;

/// Cancellable marker for non-packet events (flush, transfer phases,
/// cache update, disconnection).
#[derive(Debug, Default)]
pub struct Context {
    cancelled: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the default action associated with this event.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Per-packet interception record. At least one of raw/decoded is present
/// when a processor receives it: server items carry one or the other, and
/// client payloads always carry raw plus, when the decode rules applied,
/// the decoded packet.
pub struct PacketContext {
    raw: Option<Vec<u8>>,
    decoded: Option<Box<dyn Packet>>,
    cancelled: bool,
    modified: bool,
}

impl PacketContext {
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub fn decoded(&self) -> Option<&dyn Packet> {
        self.decoded.as_deref()
    }

    pub fn decoded_mut(&mut self) -> Option<&mut (dyn Packet + 'static)> {
        self.decoded.as_deref_mut()
    }

    /// Drop this item: nothing is forwarded for it.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Mark the decoded packet as rewritten. Client-path edits that are
    /// not marked are lost: the relay forwards the original raw bytes.
    pub fn set_modified(&mut self) {
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn take_raw(&mut self) -> Option<Vec<u8>> {
        self.raw.take()
    }

    pub(crate) fn take_decoded(&mut self) -> Option<Box<dyn Packet>> {
        self.decoded.take()
    }
}

/// Reuse pool for [`PacketContext`]. One context is built per payload per
/// batch, so the relay recycles them instead of allocating. Acquisition
/// overwrites both payload slots and clears both flags; a recycled context
/// is indistinguishable from a fresh one.
pub(crate) struct ContextPool {
    free: Mutex<Vec<PacketContext>>,
}

impl ContextPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn acquire(
        &self,
        raw: Option<Vec<u8>>,
        decoded: Option<Box<dyn Packet>>,
    ) -> PacketContext {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut ctx) => {
                ctx.raw = raw;
                ctx.decoded = decoded;
                ctx.cancelled = false;
                ctx.modified = false;
                ctx
            }
            None => PacketContext {
                raw,
                decoded,
                cancelled: false,
                modified: false,
            },
        }
    }

    pub(crate) fn release(&self, mut ctx: PacketContext) {
        ctx.raw = None;
        ctx.decoded = None;
        ctx.cancelled = false;
        ctx.modified = false;
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if free.len() < MAX_POOLED_CONTEXTS {
            free.push(ctx);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Session interception hooks. All methods default to doing nothing, so
/// implementors override selectively.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Called once during session start with the client's game data.
    async fn process_start_game(&self, _ctx: &mut Context, _data: &GameData) {}

    /// Called before forwarding a server-sent item to the client.
    async fn process_server(&self, _ctx: &mut PacketContext) {}

    /// Called once per client batch with the ordered contexts. Cancel and
    /// modify flags are honored per item.
    async fn process_client(&self, _batch: &mut [PacketContext]) {}

    /// Called before flushing the client's buffer on downstream request.
    async fn process_flush(&self, _ctx: &mut Context) {}

    /// Called before transferring to a different server. `target` may be
    /// rewritten to redirect the transfer.
    async fn process_pre_transfer(
        &self,
        _ctx: &mut Context,
        _origin: &mut String,
        _target: &mut String,
    ) {
    }

    /// Called when a transfer attempt fails to reach the target.
    async fn process_transfer_failure(
        &self,
        _ctx: &mut Context,
        _origin: &mut String,
        _target: &mut String,
    ) {
    }

    /// Called after the session has moved to a new server.
    async fn process_post_transfer(
        &self,
        _ctx: &mut Context,
        _origin: &mut String,
        _target: &mut String,
    ) {
    }

    /// Called before replacing the session cache.
    async fn process_cache(&self, _ctx: &mut Context, _blob: &mut Vec<u8>) {}

    /// Called when the session closes, with the disconnect message.
    async fn process_disconnection(&self, _ctx: &mut Context, _message: &mut String) {}
}

/// No-operation [`Processor`].
pub struct NopProcessor;

#[async_trait]
impl Processor for NopProcessor {}
