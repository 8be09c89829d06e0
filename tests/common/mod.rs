//! Shared fakes for the session integration tests: a tiny two-packet
//! protocol, channel-backed client/server connections, a scripted dialer,
//! and a recording processor/tracker.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use passage::{
    ClientConn, Context, ControlPacket, Dialer, GameData, Header, ItemEntry, Packet,
    PacketContext, PacketId, PacketPool, PacketReader, PacketWriter, Processor, Protocol,
    ServerConn, ServerPacket, Tracker, CURRENT_PROTOCOL,
};
use passage::{BytesReader, BytesWriter};

pub const MOVE_PACKET_ID: PacketId = 0x13;
pub const CHAT_PACKET_ID: PacketId = 0x09;
pub const TEST_SHIELD_ID: i32 = 353;

/// Install the log subscriber once per test binary; controlled through
/// `RUST_LOG` so relay logs can be surfaced when a test misbehaves.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Coordinate shift applied when a legacy move packet is upgraded to the
/// latest revision, so upgrades are observable in test output.
pub const LEGACY_Y_OFFSET: i64 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovePacket {
    pub x: i64,
    pub y: i64,
}

impl Packet for MovePacket {
    fn id(&self) -> PacketId {
        MOVE_PACKET_ID
    }

    fn encode(&self, w: &mut dyn PacketWriter) -> Result<()> {
        w.write_vari64(self.x);
        w.write_vari64(self.y);
        Ok(())
    }

    fn decode(&mut self, r: &mut dyn PacketReader) -> Result<()> {
        self.x = r.read_vari64()?;
        self.y = r.read_vari64()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatPacket {
    pub message: String,
}

impl Packet for ChatPacket {
    fn id(&self) -> PacketId {
        CHAT_PACKET_ID
    }

    fn encode(&self, w: &mut dyn PacketWriter) -> Result<()> {
        w.write_string(&self.message);
        Ok(())
    }

    fn decode(&mut self, r: &mut dyn PacketReader) -> Result<()> {
        self.message = r.read_string()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn clone_packet(pk: &dyn Packet) -> Box<dyn Packet> {
    if let Some(mv) = pk.as_any().downcast_ref::<MovePacket>() {
        Box::new(mv.clone())
    } else if let Some(chat) = pk.as_any().downcast_ref::<ChatPacket>() {
        Box::new(chat.clone())
    } else {
        panic!("unknown test packet {}", pk.id())
    }
}

/// Two-packet test protocol. The legacy revision upgrades move packets by
/// shifting the y coordinate and has no latest equivalent for chat.
pub struct TestProtocol {
    id: i32,
    pool: PacketPool,
}

impl TestProtocol {
    pub fn latest() -> Arc<dyn Protocol> {
        Arc::new(Self::with_id(CURRENT_PROTOCOL))
    }

    pub fn legacy() -> Arc<dyn Protocol> {
        Arc::new(Self::with_id(CURRENT_PROTOCOL - 3))
    }

    fn with_id(id: i32) -> Self {
        let mut pool: PacketPool = HashMap::new();
        pool.insert(MOVE_PACKET_ID, || Box::new(MovePacket::default()));
        pool.insert(CHAT_PACKET_ID, || Box::new(ChatPacket::default()));
        Self { id, pool }
    }
}

impl Protocol for TestProtocol {
    fn id(&self) -> i32 {
        self.id
    }

    fn packets(&self, _from_client: bool) -> &PacketPool {
        &self.pool
    }

    fn new_reader<'a>(&self, buf: &'a [u8], shield_id: i32) -> Box<dyn PacketReader + 'a> {
        Box::new(BytesReader::new(buf, shield_id))
    }

    fn new_writer<'a>(&self, buf: &'a mut Vec<u8>, shield_id: i32) -> Box<dyn PacketWriter + 'a> {
        Box::new(BytesWriter::new(buf, shield_id))
    }

    fn convert_to_latest(&self, pk: &dyn Packet, _conn: &dyn ClientConn) -> Vec<Box<dyn Packet>> {
        if self.id == CURRENT_PROTOCOL {
            return vec![clone_packet(pk)];
        }
        if let Some(mv) = pk.as_any().downcast_ref::<MovePacket>() {
            vec![Box::new(MovePacket {
                x: mv.x,
                y: mv.y + LEGACY_Y_OFFSET,
            })]
        } else {
            // Chat has no latest-revision equivalent in the legacy path.
            Vec::new()
        }
    }

    fn latest(&self) -> Arc<dyn Protocol> {
        TestProtocol::latest()
    }
}

/// Frame a packet the way the client transport would: header + body.
pub fn encode_payload(pk: &dyn Packet, proto: &dyn Protocol) -> Vec<u8> {
    let mut buf = Vec::new();
    let header = Header {
        packet_id: pk.id(),
        ..Header::default()
    };
    header.write(&mut buf);
    let mut writer = proto.new_writer(&mut buf, TEST_SHIELD_ID);
    pk.encode(writer.as_mut()).expect("encode test packet");
    drop(writer);
    buf
}

pub fn test_game_data() -> GameData {
    GameData {
        items: vec![
            ItemEntry {
                name: "minecraft:stick".into(),
                runtime_id: 5,
            },
            ItemEntry {
                name: "minecraft:shield".into(),
                runtime_id: TEST_SHIELD_ID as i16,
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Fake client connection
// ---------------------------------------------------------------------------

pub enum ClientEvent {
    Raw(Vec<u8>),
    Packet(Box<dyn Packet>),
    Flush,
}

impl std::fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            ClientEvent::Packet(pk) => f.debug_tuple("Packet").field(&pk.id()).finish(),
            ClientEvent::Flush => write!(f, "Flush"),
        }
    }
}

pub struct FakeClient {
    batches: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<Vec<u8>>>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    latency: Duration,
    proto: Arc<dyn Protocol>,
    closed: Mutex<Option<String>>,
}

pub struct ClientHandle {
    pub batches: mpsc::UnboundedSender<Result<Vec<Vec<u8>>>>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub conn: Arc<FakeClient>,
}

pub fn fake_client(proto: Arc<dyn Protocol>, latency: Duration) -> (Arc<FakeClient>, ClientHandle) {
    init_tracing();
    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(FakeClient {
        batches: tokio::sync::Mutex::new(batch_rx),
        events: event_tx,
        latency,
        proto,
        closed: Mutex::new(None),
    });
    let handle = ClientHandle {
        batches: batch_tx,
        events: event_rx,
        conn: conn.clone(),
    };
    (conn, handle)
}

impl FakeClient {
    pub fn closed_cause(&self) -> Option<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientConn for FakeClient {
    async fn read_batch_bytes(&self) -> Result<Vec<Vec<u8>>> {
        match self.batches.lock().await.recv().await {
            Some(batch) => batch,
            None => Err(anyhow!("client disconnected")),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.events
            .send(ClientEvent::Raw(data.to_vec()))
            .map_err(|_| anyhow!("client event channel closed"))
    }

    async fn write_packet(&self, pk: &dyn Packet) -> Result<()> {
        self.events
            .send(ClientEvent::Packet(clone_packet(pk)))
            .map_err(|_| anyhow!("client event channel closed"))
    }

    async fn flush(&self) -> Result<()> {
        self.events
            .send(ClientEvent::Flush)
            .map_err(|_| anyhow!("client event channel closed"))
    }

    fn latency(&self) -> Duration {
        self.latency
    }

    fn proto(&self) -> Arc<dyn Protocol> {
        self.proto.clone()
    }

    fn game_data(&self) -> GameData {
        test_game_data()
    }

    fn close_with_error(&self, cause: &str) {
        self.closed
            .lock()
            .unwrap()
            .get_or_insert_with(|| cause.to_string());
    }
}

// ---------------------------------------------------------------------------
// Fake server connection
// ---------------------------------------------------------------------------

pub enum ServerEvent {
    Control(ControlPacket),
    Batch(Vec<Vec<u8>>),
}

impl std::fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerEvent::Control(pk) => f.debug_tuple("Control").field(pk).finish(),
            ServerEvent::Batch(payloads) => {
                f.debug_tuple("Batch").field(&payloads.len()).finish()
            }
        }
    }
}

pub struct FakeServer {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ServerPacket>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    closed: Mutex<Option<String>>,
}

pub struct ServerHandle {
    pub incoming: mpsc::UnboundedSender<Result<ServerPacket>>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub conn: Arc<FakeServer>,
}

pub fn fake_server() -> (Arc<FakeServer>, ServerHandle) {
    init_tracing();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(FakeServer {
        incoming: tokio::sync::Mutex::new(in_rx),
        events: event_tx,
        closed: Mutex::new(None),
    });
    let handle = ServerHandle {
        incoming: in_tx,
        events: event_rx,
        conn: conn.clone(),
    };
    (conn, handle)
}

impl FakeServer {
    pub fn closed_cause(&self) -> Option<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().unwrap().is_some()
    }
}

#[async_trait]
impl ServerConn for FakeServer {
    async fn read_packet(&self) -> Result<ServerPacket> {
        match self.incoming.lock().await.recv().await {
            Some(item) => item,
            None => Err(anyhow!("conn closed")),
        }
    }

    async fn write_packet(&self, pk: ControlPacket) -> Result<()> {
        self.events
            .send(ServerEvent::Control(pk))
            .map_err(|_| anyhow!("server event channel closed"))
    }

    async fn write_batch(&self, payloads: Vec<Vec<u8>>) -> Result<()> {
        self.events
            .send(ServerEvent::Batch(payloads))
            .map_err(|_| anyhow!("server event channel closed"))
    }

    fn close_with_error(&self, cause: &str) {
        self.closed
            .lock()
            .unwrap()
            .get_or_insert_with(|| cause.to_string());
    }
}

// ---------------------------------------------------------------------------
// Scripted dialer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDialer {
    servers: Mutex<HashMap<String, Vec<Arc<FakeServer>>>>,
    dialed: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a server to be handed out for the next dial of `addr`.
    pub fn register(&self, addr: &str, server: Arc<FakeServer>) {
        self.servers
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_default()
            .push(server);
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn ServerConn>> {
        self.dialed.lock().unwrap().push(addr.to_string());
        let server = self.servers.lock().unwrap().get_mut(addr).and_then(Vec::pop);
        match server {
            Some(server) => {
                let conn: Arc<dyn ServerConn> = server;
                Ok(conn)
            }
            None => Err(anyhow!("no route to {addr}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording processor and tracker
// ---------------------------------------------------------------------------

/// Processor whose behavior is scripted per test through its fields and
/// whose hook invocations are recorded in `log`.
#[derive(Default)]
pub struct TestProcessor {
    pub cancel_client_indices: Vec<usize>,
    pub cancel_server_ids: Vec<PacketId>,
    pub modify_move_to: Option<(i64, i64)>,
    pub cancel_flush: bool,
    pub cancel_transfer: bool,
    pub cancel_cache: bool,
    pub redirect_target: Option<String>,
    pub log: Arc<Mutex<Vec<String>>>,
    /// Per batch, one `(has_raw, has_decoded)` entry per context.
    pub client_batches: Arc<Mutex<Vec<Vec<(bool, bool)>>>>,
}

impl TestProcessor {
    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for TestProcessor {
    async fn process_start_game(&self, _ctx: &mut Context, _data: &GameData) {
        self.log.lock().unwrap().push("start_game".into());
    }

    async fn process_server(&self, ctx: &mut PacketContext) {
        if let Some(pk) = ctx.decoded() {
            if self.cancel_server_ids.contains(&pk.id()) {
                ctx.cancel();
            }
        }
    }

    async fn process_client(&self, batch: &mut [PacketContext]) {
        let shapes = batch
            .iter()
            .map(|ctx| (ctx.raw().is_some(), ctx.decoded().is_some()))
            .collect();
        self.client_batches.lock().unwrap().push(shapes);

        for (index, ctx) in batch.iter_mut().enumerate() {
            if self.cancel_client_indices.contains(&index) {
                ctx.cancel();
                continue;
            }
            if let Some((x, y)) = self.modify_move_to {
                if let Some(mv) = ctx
                    .decoded_mut()
                    .and_then(|pk| pk.as_any_mut().downcast_mut::<MovePacket>())
                {
                    mv.x = x;
                    mv.y = y;
                    ctx.set_modified();
                }
            }
        }
    }

    async fn process_flush(&self, ctx: &mut Context) {
        self.log.lock().unwrap().push("flush".into());
        if self.cancel_flush {
            ctx.cancel();
        }
    }

    async fn process_pre_transfer(
        &self,
        ctx: &mut Context,
        origin: &mut String,
        target: &mut String,
    ) {
        self.log
            .lock()
            .unwrap()
            .push(format!("pre_transfer {origin} -> {target}"));
        if let Some(redirect) = &self.redirect_target {
            *target = redirect.clone();
        }
        if self.cancel_transfer {
            ctx.cancel();
        }
    }

    async fn process_transfer_failure(
        &self,
        _ctx: &mut Context,
        origin: &mut String,
        target: &mut String,
    ) {
        self.log
            .lock()
            .unwrap()
            .push(format!("transfer_failure {origin} -> {target}"));
    }

    async fn process_post_transfer(
        &self,
        _ctx: &mut Context,
        origin: &mut String,
        target: &mut String,
    ) {
        self.log
            .lock()
            .unwrap()
            .push(format!("post_transfer {origin} -> {target}"));
    }

    async fn process_cache(&self, ctx: &mut Context, _blob: &mut Vec<u8>) {
        self.log.lock().unwrap().push("cache".into());
        if self.cancel_cache {
            ctx.cancel();
        }
    }

    async fn process_disconnection(&self, _ctx: &mut Context, message: &mut String) {
        self.log
            .lock()
            .unwrap()
            .push(format!("disconnection {message}"));
    }
}

/// Tracker recording the ids it observed and how often it was reset.
#[derive(Default)]
pub struct RecordingTracker {
    pub observed: Arc<Mutex<Vec<PacketId>>>,
    pub resets: Arc<Mutex<usize>>,
}

impl Tracker for RecordingTracker {
    fn handle_packet(&mut self, pk: &dyn Packet) {
        self.observed.lock().unwrap().push(pk.id());
    }

    fn reset(&mut self) {
        *self.resets.lock().unwrap() += 1;
    }
}

// ---------------------------------------------------------------------------
// Session setup helpers
// ---------------------------------------------------------------------------

pub const FIRST_SERVER_ADDR: &str = "a:19132";

/// Config with the heartbeat pushed out of the way so tests can assert on
/// the downstream event stream without latency reports interleaving.
pub fn quiet_config() -> passage::SessionConfig {
    passage::SessionConfig {
        latency_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Spawn a session over fresh fakes with a no-op tracker.
pub async fn start_session(
    proto: Arc<dyn Protocol>,
    config: passage::SessionConfig,
    processor: Arc<TestProcessor>,
) -> (
    Arc<passage::Session>,
    ClientHandle,
    ServerHandle,
    Arc<FakeDialer>,
) {
    let (client, client_handle) = fake_client(proto, Duration::from_millis(35));
    let (server, server_handle) = fake_server();
    let dialer = FakeDialer::new();
    let session = passage::Session::spawn(
        client,
        server,
        FIRST_SERVER_ADDR,
        config,
        processor,
        Box::new(passage::NopTracker),
        dialer.clone(),
    )
    .await;
    (session, client_handle, server_handle, dialer)
}

// ---------------------------------------------------------------------------
// Async test helpers
// ---------------------------------------------------------------------------

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `cond` until it holds or the test timeout elapses.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next event or fail the test after the timeout.
pub async fn next_server_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server event channel closed")
}

pub async fn next_client_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client event channel closed")
}
