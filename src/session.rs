//! Session lifecycle and downstream ownership.
//!
//! A [`Session`] pins one client connection for its whole life and holds
//! the currently selected downstream in a swappable slot. Three tasks are
//! launched per session (server→client relay, client→server relay, latency
//! reporter); all of them observe the session's cancellation token and any
//! of them may close the session with a cause. Transfer and fallback both
//! funnel through the same serialized swap so at most one downstream
//! replacement is in flight at a time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::conn::{ClientConn, Dialer, GameData, ServerConn};
use crate::processor::{Context, ContextPool, Processor};
use crate::relay;
use crate::tracker::Tracker;

/// Item whose runtime id protocol readers and writers need at hand.
const SHIELD_ITEM_NAME: &str = "minecraft:shield";

/// Marker cause for errors that merely report an already-closing session.
/// Such errors are artifacts of teardown, not failures, and are never
/// logged as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

impl std::fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session closed")
    }
}

impl std::error::Error for SessionClosed {}

/// True when the error is, or wraps, a [`SessionClosed`] cause.
pub fn is_session_closed(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<SessionClosed>().is_some())
}

struct ServerSlot {
    conn: Arc<dyn ServerConn>,
    addr: String,
}

/// Lifecycle container for one client and its current downstream.
pub struct Session {
    client: Arc<dyn ClientConn>,
    server: RwLock<ServerSlot>,
    cancel: CancellationToken,
    cause: OnceLock<String>,
    processor: Arc<dyn Processor>,
    tracker: Mutex<Box<dyn Tracker>>,
    cache: Mutex<Vec<u8>>,
    latency: AtomicI64,
    config: SessionConfig,
    dialer: Arc<dyn Dialer>,
    shield_id: i32,
    transfer_lock: tokio::sync::Mutex<()>,
    pool: ContextPool,
}

impl Session {
    /// Create a session for a client whose login has completed and whose
    /// first downstream is attached, then launch its three relay tasks.
    pub async fn spawn(
        client: Arc<dyn ClientConn>,
        server: Arc<dyn ServerConn>,
        server_addr: impl Into<String>,
        config: SessionConfig,
        processor: Arc<dyn Processor>,
        tracker: Box<dyn Tracker>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        let game_data = client.game_data();
        let session = Arc::new(Self {
            client,
            server: RwLock::new(ServerSlot {
                conn: server,
                addr: server_addr.into(),
            }),
            cancel: CancellationToken::new(),
            cause: OnceLock::new(),
            processor,
            tracker: Mutex::new(tracker),
            cache: Mutex::new(Vec::new()),
            latency: AtomicI64::new(0),
            config,
            dialer,
            shield_id: shield_runtime_id(&game_data),
            transfer_lock: tokio::sync::Mutex::new(()),
            pool: ContextPool::new(),
        });

        let mut ctx = Context::new();
        session
            .processor
            .process_start_game(&mut ctx, &game_data)
            .await;

        tokio::spawn(relay::server_to_client(session.clone()));
        tokio::spawn(relay::client_to_server(session.clone()));
        tokio::spawn(relay::latency_reporter(session.clone()));
        info!(server = %session.server_addr(), "session started");
        session
    }

    pub fn client(&self) -> &Arc<dyn ClientConn> {
        &self.client
    }

    /// The currently selected downstream. Relay reads and writes always go
    /// through the value returned here at the moment of the call.
    pub fn server(&self) -> Arc<dyn ServerConn> {
        self.server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .conn
            .clone()
    }

    /// Address of the current downstream.
    pub fn server_addr(&self) -> String {
        self.server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .addr
            .clone()
    }

    /// Whether `conn` is still the session's current downstream. Reads
    /// that fail against a stale one are discarded, never escalated.
    pub(crate) fn is_current_server(&self, conn: &Arc<dyn ServerConn>) -> bool {
        Arc::ptr_eq(
            &self
                .server
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .conn,
            conn,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    pub(crate) fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Shield runtime id captured from the client's game data at session
    /// start; protocol readers and writers are constructed with it.
    pub fn shield_id(&self) -> i32 {
        self.shield_id
    }

    /// Last latency value published by the downstream, in milliseconds.
    pub fn latency(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    pub(crate) fn store_latency(&self, value: i64) {
        self.latency.store(value, Ordering::Relaxed);
    }

    /// Current session cache blob.
    pub fn cache(&self) -> Vec<u8> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the session cache. The processor sees the incoming blob
    /// first and may rewrite it or cancel the update.
    pub async fn set_cache(&self, blob: Vec<u8>) {
        let mut blob = blob;
        let mut ctx = Context::new();
        self.processor.process_cache(&mut ctx, &mut blob).await;
        if ctx.is_cancelled() {
            return;
        }
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = blob;
    }

    pub(crate) fn track_packet(&self, pk: &dyn crate::protocol::Packet) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle_packet(pk);
    }

    fn reset_tracker(&self) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cause the session was closed with, once it has been.
    pub fn close_cause(&self) -> Option<&str> {
        self.cause.get().map(String::as_str)
    }

    /// Close the session with a cause. The first caller wins; later calls
    /// are no-ops. Both connections are closed with the cause and the
    /// disconnection hook runs with the (rewritable) message.
    pub async fn close_with_error(&self, err: anyhow::Error) {
        let mut message = format!("{err:#}");
        if self.cause.set(message.clone()).is_err() {
            return;
        }
        self.cancel.cancel();

        let mut ctx = Context::new();
        self.processor
            .process_disconnection(&mut ctx, &mut message)
            .await;

        self.client.close_with_error(&message);
        self.server().close_with_error(&message);
        if is_session_closed(&err) {
            debug!("session closed");
        } else {
            info!(cause = %message, "session closed");
        }
    }

    /// Move the session to the downstream at `addr`. The pre-transfer hook
    /// may redirect or cancel the move; a dial failure leaves the session
    /// on its current downstream and surfaces through the
    /// transfer-failure hook as well as the returned error.
    pub async fn transfer(&self, addr: impl Into<String>) -> Result<()> {
        let _guard = self.transfer_lock.lock().await;
        if self.is_closed() {
            return Err(anyhow!(SessionClosed));
        }

        let mut origin = self.server_addr();
        let mut target = addr.into();
        let mut ctx = Context::new();
        self.processor
            .process_pre_transfer(&mut ctx, &mut origin, &mut target)
            .await;
        if ctx.is_cancelled() {
            debug!(%origin, %target, "transfer cancelled by processor");
            return Ok(());
        }

        let conn = match self.dialer.dial(&target).await {
            Ok(conn) => conn,
            Err(err) => {
                let mut fctx = Context::new();
                self.processor
                    .process_transfer_failure(&mut fctx, &mut origin, &mut target)
                    .await;
                return Err(err.context(format!("failed to dial {target}")));
            }
        };

        let old = self.install_server(conn, target.clone());
        old.close_with_error("transferred to another server");
        self.reset_tracker();

        let mut pctx = Context::new();
        self.processor
            .process_post_transfer(&mut pctx, &mut origin, &mut target)
            .await;
        info!(%origin, %target, "transferred to new server");
        Ok(())
    }

    /// Replace a failed downstream with the first reachable configured
    /// fallback. A no-op when `failed` has already been swapped out by a
    /// concurrent transfer. Exhausting every candidate is an error; the
    /// caller terminates the session with it.
    pub(crate) async fn fallback(&self, failed: &Arc<dyn ServerConn>) -> Result<()> {
        let _guard = self.transfer_lock.lock().await;
        if !self.is_current_server(failed) {
            return Ok(());
        }

        for addr in &self.config.fallback_addrs {
            match self.dialer.dial(addr).await {
                Ok(conn) => {
                    let old = self.install_server(conn, addr.clone());
                    old.close_with_error("fell back to another server");
                    self.reset_tracker();
                    info!(addr = %addr, "fell back to new server");
                    return Ok(());
                }
                Err(err) => {
                    warn!(addr = %addr, "fallback candidate unreachable: {err:#}");
                }
            }
        }
        Err(anyhow!("no reachable fallback server"))
    }

    /// Swap the current downstream slot, returning the previous conn for
    /// the caller to close. Callers hold the transfer lock.
    fn install_server(&self, conn: Arc<dyn ServerConn>, addr: String) -> Arc<dyn ServerConn> {
        let old = {
            let mut slot = self.server.write().unwrap_or_else(PoisonError::into_inner);
            slot.addr = addr;
            std::mem::replace(&mut slot.conn, conn)
        };
        // A swap that raced session teardown installed a conn the
        // teardown never saw; it gets the same cause.
        if let Some(cause) = self.close_cause() {
            self.server().close_with_error(cause);
        }
        old
    }
}

fn shield_runtime_id(data: &GameData) -> i32 {
    data.items
        .iter()
        .find(|item| item.name == SHIELD_ITEM_NAME)
        .map(|item| i32::from(item.runtime_id))
        .unwrap_or(0)
}
