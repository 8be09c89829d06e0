//! The three per-session relay tasks.
//!
//! `server_to_client` pulls one item at a time from the current downstream
//! and dispatches on its kind; `client_to_server` turns whole client
//! batches into ordered payloads for the downstream, decoding selectively
//! and re-encoding what the processor rewrote; `latency_reporter` pushes
//! the client's measured latency to the downstream on an interval. All
//! three exit through the session's cancellation token.
//!
//! Batch handling and per-payload decoding sit behind panic-recovery
//! boundaries: a malformed payload or a misbehaving packet registry
//! degrades to an error at its boundary instead of killing the process.

use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use tracing::{error, warn};

use crate::conn::{ControlPacket, ServerPacket};
use crate::processor::{Context, PacketContext};
use crate::protocol::{Header, PacketPool, Protocol, CURRENT_PROTOCOL};
use crate::session::{is_session_closed, Session, SessionClosed};

/// Continuously read items from the current downstream and forward them to
/// the client.
pub(crate) async fn server_to_client(session: Arc<Session>) {
    loop {
        if session.is_closed() {
            session.close_with_error(anyhow!(SessionClosed)).await;
            break;
        }

        let server = session.server();
        let item = tokio::select! {
            _ = session.cancelled() => {
                session.close_with_error(anyhow!(SessionClosed)).await;
                break;
            }
            item = server.read_packet() => item,
        };

        let pk = match item {
            Ok(pk) => pk,
            Err(err) => {
                // A read failing against a conn that is no longer the
                // session's downstream lost a race with a swap.
                if !session.is_current_server(&server) {
                    continue;
                }
                let err = err.context("failed to read packet from server");
                server.close_with_error(&format!("{err:#}"));
                log_error(&session, "failed to read packet from server", &err);
                if let Err(err) = session.fallback(&server).await {
                    let err = err.context("fallback failed");
                    log_error(&session, "fallback failed", &err);
                    session.close_with_error(err).await;
                    break;
                }
                continue;
            }
        };

        match pk {
            ServerPacket::Flush => {
                let mut ctx = Context::new();
                session.processor().process_flush(&mut ctx).await;
                if ctx.is_cancelled() {
                    continue;
                }
                if let Err(err) = session.client().flush().await {
                    let err = err.context("failed to flush client connection");
                    log_error(&session, "failed to flush client connection", &err);
                    session.close_with_error(err).await;
                    break;
                }
            }
            ServerPacket::Latency { latency, .. } => session.store_latency(latency),
            ServerPacket::Transfer { addr } => {
                if let Err(err) = session.transfer(addr).await {
                    log_error(&session, "failed to transfer", &err);
                }
            }
            ServerPacket::UpdateCache { blob } => session.set_cache(blob).await,
            ServerPacket::Packet(pk) => {
                let mut ctx = session.pool().acquire(None, Some(pk));
                session.processor().process_server(&mut ctx).await;
                if ctx.is_cancelled() {
                    session.pool().release(ctx);
                    continue;
                }
                let pk = match ctx.take_decoded() {
                    Some(pk) => pk,
                    None => {
                        session.pool().release(ctx);
                        continue;
                    }
                };
                session.pool().release(ctx);

                // The tracker mirrors latest-revision state. With a
                // synced downstream the packet arrives in the client's
                // revision and is upgraded for the mirror only; the
                // client still receives the original.
                if session.config().sync_protocol {
                    let proto = session.client().proto();
                    for latest in proto.convert_to_latest(pk.as_ref(), session.client().as_ref())
                    {
                        session.track_packet(latest.as_ref());
                    }
                } else {
                    session.track_packet(pk.as_ref());
                }

                if let Err(err) = session.client().write_packet(pk.as_ref()).await {
                    let err = err.context("failed to write packet to client");
                    log_error(&session, "failed to write packet to client", &err);
                    session.close_with_error(err).await;
                    break;
                }
            }
            ServerPacket::Raw(bytes) => {
                let mut ctx = session.pool().acquire(Some(bytes), None);
                session.processor().process_server(&mut ctx).await;
                if ctx.is_cancelled() {
                    session.pool().release(ctx);
                    continue;
                }
                let raw = match ctx.take_raw() {
                    Some(raw) => raw,
                    None => {
                        session.pool().release(ctx);
                        continue;
                    }
                };
                session.pool().release(ctx);

                if let Err(err) = session.client().write(&raw).await {
                    let err = err.context("failed to write packet to client");
                    log_error(&session, "failed to write packet to client", &err);
                    session.close_with_error(err).await;
                    break;
                }
            }
        }
    }
}

/// Continuously read batches from the client and forward them to the
/// current downstream.
pub(crate) async fn client_to_server(session: Arc<Session>) {
    let proto = session.client().proto();
    let pool = proto.packets(true);
    let shield_id = session.shield_id();

    loop {
        if session.is_closed() {
            session.close_with_error(anyhow!(SessionClosed)).await;
            break;
        }

        let batch = tokio::select! {
            _ = session.cancelled() => {
                session.close_with_error(anyhow!(SessionClosed)).await;
                break;
            }
            batch = session.client().read_batch_bytes() => batch,
        };

        let payloads = match batch {
            Ok(payloads) => payloads,
            Err(err) => {
                let err = err.context("failed to read batch from client");
                log_error(&session, "failed to read batch from client", &err);
                session.close_with_error(err).await;
                break;
            }
        };

        let result =
            AssertUnwindSafe(handle_batch(&session, proto.as_ref(), pool, shield_id, payloads))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow!("panic while handling batch: {}", panic_message(panic)))
                });
        if let Err(err) = result {
            let err = err.context("failed to forward batch to server");
            session.server().close_with_error(&format!("{err:#}"));
            log_error(&session, "failed to forward batch to server", &err);
            session.close_with_error(err).await;
            break;
        }
    }
}

/// Current time as milliseconds since the Unix epoch.
fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Periodically report the client's current latency to the downstream.
/// The transport exposes half the round-trip time, so the reported value
/// is doubled. Write failures are logged and the reporter keeps going.
pub(crate) async fn latency_reporter(session: Arc<Session>) {
    let mut interval = tokio::time::interval(session.config().latency_interval);
    interval.tick().await; // Skip initial tick
    loop {
        tokio::select! {
            _ = session.cancelled() => {
                session.close_with_error(anyhow!(SessionClosed)).await;
                break;
            }
            _ = interval.tick() => {
                let latency = session.client().latency().as_millis() as i64 * 2;
                let report = ControlPacket::Latency { latency, timestamp: unix_millis() };
                if let Err(err) = session.server().write_packet(report).await {
                    log_error(&session, "failed to write latency packet", &err);
                }
            }
        }
    }
}

/// Turn one client batch into ordered downstream payloads: decode each
/// payload per the selective-decode rules, run the processor once over
/// the whole batch, re-encode what was rewritten, and write the result as
/// a single batch. Order is preserved; cancellations compact it.
async fn handle_batch(
    session: &Arc<Session>,
    proto: &dyn Protocol,
    pool: &PacketPool,
    shield_id: i32,
    payloads: Vec<Vec<u8>>,
) -> Result<()> {
    let mut batch = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if let Some(ctx) = decode_payload(session, proto, pool, shield_id, payload)? {
            batch.push(ctx);
        }
    }

    session.processor().process_client(&mut batch).await;

    let write_proto_owned;
    let write_proto: &dyn Protocol = if session.config().sync_protocol {
        proto
    } else {
        write_proto_owned = proto.latest();
        write_proto_owned.as_ref()
    };

    let mut out = Vec::with_capacity(batch.len());
    for mut ctx in batch {
        if ctx.is_cancelled() {
            session.pool().release(ctx);
            continue;
        }

        if ctx.decoded().is_none() || !ctx.is_modified() {
            if let Some(raw) = ctx.take_raw() {
                out.push(raw);
            }
            session.pool().release(ctx);
            continue;
        }

        // The packet was rewritten (by the processor or by the version
        // upgrade), so the original bytes are stale and it has to be
        // re-encoded for the downstream's revision.
        let pk = match ctx.take_decoded() {
            Some(pk) => pk,
            None => {
                session.pool().release(ctx);
                continue;
            }
        };
        session.pool().release(ctx);

        let mut buf = Vec::new();
        let header = Header {
            packet_id: pk.id(),
            ..Header::default()
        };
        header.write(&mut buf);
        {
            let mut writer = write_proto.new_writer(&mut buf, shield_id);
            pk.encode(writer.as_mut())?;
        }
        out.push(buf);
    }

    session.server().write_batch(out).await
}

/// Decode one client payload into a context per the selective-decode
/// rules, or skip it (`None`) when a version upgrade erases it.
fn decode_payload(
    session: &Session,
    proto: &dyn Protocol,
    pool: &PacketPool,
    shield_id: i32,
    payload: Vec<u8>,
) -> Result<Option<PacketContext>> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(
        || -> Result<Option<PacketContext>> {
            let mut header = Header::default();
            let mut cursor = Cursor::new(payload.as_slice());
            header
                .read(&mut cursor)
                .map_err(|_| anyhow!("failed to decode header"))?;
            let body_start = cursor.position() as usize;

            let factory = *pool
                .get(&header.packet_id)
                .ok_or_else(|| anyhow!("unknown packet with id {}", header.packet_id))?;

            // A payload from a legacy client may never pass through raw:
            // the downstream expects the latest revision, so the packet
            // has to be decoded here and upgraded.
            let client_on_latest = proto.id() == CURRENT_PROTOCOL;
            let config = session.config();
            if !config.client_decode.contains(&header.packet_id)
                && (config.sync_protocol || client_on_latest)
            {
                return Ok(Some(session.pool().acquire(Some(payload), None)));
            }

            let mut pk = factory();
            {
                let mut reader = proto.new_reader(&payload[body_start..], shield_id);
                pk.decode(reader.as_mut())?;
                let extra = reader.remaining();
                if extra > 0 {
                    bail!("packet {} had {extra} extra bytes", header.packet_id);
                }
            }

            if !config.sync_protocol && !client_on_latest {
                let mut upgraded = proto.convert_to_latest(pk.as_ref(), session.client().as_ref());
                if upgraded.is_empty() {
                    return Ok(None);
                }
                if upgraded.len() > 1 {
                    warn!(
                        packet_id = header.packet_id,
                        dropped = upgraded.len() - 1,
                        "client packet upgrade fanned out, keeping only the first packet"
                    );
                }
                let mut ctx = session
                    .pool()
                    .acquire(Some(payload), Some(upgraded.swap_remove(0)));
                // The upgraded form differs from the bytes on the wire, so
                // it must be re-encoded rather than passed through.
                ctx.set_modified();
                return Ok(Some(ctx));
            }
            Ok(Some(session.pool().acquire(Some(payload), Some(pk))))
        },
    ));
    outcome.unwrap_or_else(|panic| {
        Err(anyhow!(
            "panic while decoding packet from client batch: {}",
            panic_message(panic)
        ))
    })
}

/// Log an error unless it is an artifact of the session shutting down.
pub(crate) fn log_error(session: &Session, msg: &str, err: &anyhow::Error) {
    if session.is_closed() || is_session_closed(err) {
        return;
    }
    error!("{msg}: {err:#}");
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
