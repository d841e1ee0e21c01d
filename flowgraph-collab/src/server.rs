//! WebSocket relay with one room per pipeline.
//!
//! ```text
//! Session A ──┐
//!             ├── Room (pipeline id) ── yrs Doc ── BroadcastGroup
//! Session B ──┘        │                   │
//!                      │ awareness cache   └── LocalStore (optional)
//!                      ▼
//!              replayed to late joiners
//! ```
//!
//! Each room keeps an authoritative yrs document so late joiners can sync
//! from it, plus the last awareness frame of every connected session. A
//! session may only write its own awareness slot; frames claiming another
//! session id are dropped.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::RoomManager;
use crate::protocol::{ConnectParams, MessageType, PeerInfo, SyncMessage};
use crate::storage::{document_key, LocalStore, StoreConfig, StoreError};
use flowgraph_core::AwarenessMessage;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

const KEY_PREFIX: &str = "pipeline-";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Read `FLOWGRAPH_RELAY_ADDR` / `FLOWGRAPH_RELAY_DATA`, defaulting the rest.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("FLOWGRAPH_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("FLOWGRAPH_RELAY_DATA") {
            config.storage_path = Some(PathBuf::from(path));
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    /// Awareness frames dropped for writing another session's slot
    pub rejected_awareness: u64,
}

/// Authoritative state of one pipeline room.
struct PipelineRoom {
    doc: yrs::Doc,
    /// Last encoded awareness frame per session.
    awareness: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl PipelineRoom {
    fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
            awareness: HashMap::new(),
        }
    }

    fn apply(&self, update: &[u8]) -> Result<(), BoxError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)?;
        Ok(())
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

struct Shared {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, PipelineRoom>>,
    room_manager: RoomManager,
    stats: RwLock<ServerStats>,
    store: Option<Arc<LocalStore>>,
}

/// The relay server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(LocalStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Use an already opened store (shared with other components or tests).
    pub fn with_store(config: ServerConfig, store: Option<Arc<LocalStore>>) -> Self {
        let room_manager = RoomManager::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                room_manager,
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        }
    }

    /// In-memory relay with default settings.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    /// Preload every persisted pipeline into a room.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };

        let keys = store.list_documents()?;
        let mut recovered = 0;
        let mut rooms = self.shared.rooms.write().await;
        for key in &keys {
            let Some(pipeline_id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let room = rooms
                .entry(pipeline_id.to_string())
                .or_insert_with(PipelineRoom::new);
            for update in store.load_state(key)? {
                if let Err(e) = room.apply(&update) {
                    log::warn!("Skipping unreadable update for {key}: {e}");
                }
            }
            recovered += 1;
            log::info!("Recovered pipeline {pipeline_id} from storage");
        }

        log::info!("Recovery complete: {recovered}/{} documents restored", keys.len());
        Ok(recovered)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} pipelines from persistent storage");
        }
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<LocalStore>> {
        self.shared.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Sessions currently joined to a pipeline room.
    pub async fn peers(&self, pipeline_id: &str) -> Vec<PeerInfo> {
        match self.shared.room_manager.get(pipeline_id).await {
            Some(group) => group.peers().await,
            None => Vec::new(),
        }
    }

    /// Full yrs state of a room, if it is loaded.
    pub async fn room_state(&self, pipeline_id: &str) -> Option<Vec<u8>> {
        self.shared
            .rooms
            .read()
            .await
            .get(pipeline_id)
            .map(PipelineRoom::encode_state)
    }
}

/// Membership of one connection once it has joined a room.
struct Membership {
    session_id: Uuid,
    pipeline_id: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), BoxError> {
    let mut params: Option<ConnectParams> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            params = req.uri().query().and_then(ConnectParams::from_query);
            log::debug!("Upgrade request for {} from {addr}", req.uri().path());
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    match &params {
        Some(p) => log::info!(
            "WebSocket connection established from {addr} for {} ({})",
            p.user_name,
            p.user_id
        ),
        None => log::info!("WebSocket connection established from {addr} without identity"),
    }

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut member: Option<Membership> = None;
    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match SyncMessage::decode(&bytes) {
                                Ok(frame) => {
                                    {
                                        let mut s = shared.stats.write().await;
                                        s.total_messages += 1;
                                        s.total_bytes += bytes.len() as u64;
                                    }
                                    if !handle_frame(&shared, &mut ws_sender, &mut member, params.as_ref(), frame).await? {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outgoing = async {
                    match member.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match outgoing {
                        Ok(data) => {
                            let own = member.as_ref().map(|m| m.session_id);
                            if let Ok(frame) = SyncMessage::decode(&data) {
                                if Some(frame.session_id) == own {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session at {addr} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(m) = member {
        leave_room(&shared, m.session_id, &m.pipeline_id).await;
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

async fn send_frame(sink: &mut WsSink, frame: &SyncMessage) -> Result<(), BoxError> {
    sink.send(Message::Binary(frame.encode()?.into())).await?;
    Ok(())
}

/// Route one decoded frame. Returns `false` to close the connection.
async fn handle_frame(
    shared: &Arc<Shared>,
    sink: &mut WsSink,
    member: &mut Option<Membership>,
    params: Option<&ConnectParams>,
    frame: SyncMessage,
) -> Result<bool, BoxError> {
    if frame.msg_type == MessageType::PeerJoined {
        if member.is_some() {
            log::warn!("Session {} sent a second join; ignoring", frame.session_id);
            return Ok(true);
        }
        return match join_room(shared, sink, params, &frame).await? {
            Some(m) => {
                *member = Some(m);
                Ok(true)
            }
            None => Ok(false),
        };
    }

    if frame.msg_type == MessageType::Ping {
        send_frame(sink, &SyncMessage::pong(frame.session_id)).await?;
        return Ok(true);
    }

    let Some(m) = member.as_ref() else {
        log::debug!("Dropping {:?} before join", frame.msg_type);
        return Ok(true);
    };
    let pipeline_id = m.pipeline_id.as_str();

    match frame.msg_type {
        MessageType::SyncStep1 => {
            let answer = {
                let rooms = shared.rooms.read().await;
                match rooms.get(pipeline_id) {
                    Some(room) => {
                        let txn = room.doc.transact();
                        let remote_sv = StateVector::decode_v1(&frame.payload)?;
                        Some((txn.encode_diff_v1(&remote_sv), txn.state_vector().encode_v1()))
                    }
                    None => None,
                }
            };
            if let Some((diff, sv)) = answer {
                send_frame(sink, &SyncMessage::sync_step2(Uuid::nil(), pipeline_id, diff)).await?;
                send_frame(sink, &SyncMessage::sync_step1(Uuid::nil(), pipeline_id, sv)).await?;
            }
        }

        MessageType::SyncStep2 | MessageType::Delta => {
            // A SyncStep2 from a session carries its offline edits; peers
            // receive it as an ordinary delta.
            let relay = if frame.msg_type == MessageType::Delta {
                frame
            } else {
                SyncMessage::delta(frame.session_id, pipeline_id, frame.clock, frame.payload)
            };
            apply_and_relay(shared, pipeline_id, relay).await;
        }

        MessageType::Awareness => {
            route_awareness(shared, m.session_id, pipeline_id, frame).await?;
        }

        other => log::debug!("Unhandled frame type {other:?}"),
    }
    Ok(true)
}

async fn join_room(
    shared: &Arc<Shared>,
    sink: &mut WsSink,
    params: Option<&ConnectParams>,
    frame: &SyncMessage,
) -> Result<Option<Membership>, BoxError> {
    let pipeline_id = frame.pipeline_id.clone();
    // The upgrade request names the user; the frame only adds the session.
    let info = match (params, frame.peer_info()) {
        (Some(p), Ok(announced)) => {
            if announced.user_id != p.user_id {
                log::warn!(
                    "Session {} announced user {} but connected as {}",
                    frame.session_id,
                    announced.user_id,
                    p.user_id
                );
            }
            PeerInfo::new(frame.session_id, p.user_id.as_str(), p.user_name.as_str())
        }
        (Some(p), Err(e)) => {
            log::warn!("Unreadable peer info from {}: {e}", frame.session_id);
            PeerInfo::new(frame.session_id, p.user_id.as_str(), p.user_name.as_str())
        }
        (None, Ok(announced)) => announced,
        (None, Err(e)) => {
            log::warn!("Unreadable peer info from {}: {e}", frame.session_id);
            PeerInfo::new(frame.session_id, "anonymous", "Anonymous")
        }
    };

    let group = shared.room_manager.get_or_create(&pipeline_id).await;
    if group.peer_count().await >= shared.config.max_peers_per_room {
        log::warn!(
            "Room {pipeline_id} is full ({} peers); rejecting {}",
            shared.config.max_peers_per_room,
            info.session_id
        );
        return Ok(None);
    }

    let cached: Vec<Arc<Vec<u8>>> = {
        let mut rooms = shared.rooms.write().await;
        let room = rooms.entry(pipeline_id.clone()).or_insert_with(|| {
            let room = PipelineRoom::new();
            if let Some(store) = &shared.store {
                load_persisted(store, &pipeline_id, &room);
            }
            room
        });
        let cached = room.awareness.values().cloned().collect();
        let mut s = shared.stats.write().await;
        s.active_rooms = rooms.len();
        cached
    };

    let rx = group.add_peer(info.clone()).await;
    for bytes in cached {
        sink.send(Message::Binary(bytes.to_vec().into())).await?;
    }
    group.broadcast(&SyncMessage::peer_joined(&pipeline_id, &info)?)?;

    log::info!(
        "Session {} ({}) joined pipeline {pipeline_id}",
        info.session_id,
        info.user_name
    );
    Ok(Some(Membership {
        session_id: info.session_id,
        pipeline_id,
        rx,
    }))
}

fn load_persisted(store: &LocalStore, pipeline_id: &str, room: &PipelineRoom) {
    let key = document_key(pipeline_id);
    match store.load_state(&key) {
        Ok(updates) => {
            let count = updates.len();
            for update in updates {
                if let Err(e) = room.apply(&update) {
                    log::warn!("Skipping unreadable update for {key}: {e}");
                }
            }
            if count > 0 {
                log::info!("Loaded {count} persisted updates for pipeline {pipeline_id}");
            }
        }
        Err(e) => log::error!("Failed to load {key}: {e}"),
    }
}

async fn apply_and_relay(shared: &Arc<Shared>, pipeline_id: &str, frame: SyncMessage) {
    {
        let rooms = shared.rooms.read().await;
        let Some(room) = rooms.get(pipeline_id) else {
            return;
        };
        if let Err(e) = room.apply(&frame.payload) {
            log::warn!("Rejected update from {} in {pipeline_id}: {e}", frame.session_id);
            return;
        }
    }

    if let Some(store) = &shared.store {
        match store.append_delta(&document_key(pipeline_id), &frame.payload) {
            Ok(_) => shared.stats.write().await.persisted_deltas += 1,
            Err(e) => log::error!("Failed to persist delta for {pipeline_id}: {e}"),
        }
    }

    if let Some(group) = shared.room_manager.get(pipeline_id).await {
        if let Err(e) = group.broadcast(&frame) {
            log::warn!("Failed to relay delta in {pipeline_id}: {e}");
        }
    }
}

async fn route_awareness(
    shared: &Arc<Shared>,
    session_id: Uuid,
    pipeline_id: &str,
    frame: SyncMessage,
) -> Result<(), BoxError> {
    let message = match frame.awareness_message() {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping unreadable awareness from {session_id}: {e}");
            return Ok(());
        }
    };
    if message.session_id() != session_id || frame.session_id != session_id {
        log::warn!(
            "Session {session_id} tried to write slot {} in {pipeline_id}",
            message.session_id()
        );
        shared.stats.write().await.rejected_awareness += 1;
        return Ok(());
    }

    let encoded = Arc::new(frame.encode()?);
    {
        let mut rooms = shared.rooms.write().await;
        if let Some(room) = rooms.get_mut(pipeline_id) {
            match message {
                AwarenessMessage::State { .. } => {
                    log::trace!("Awareness update from {session_id} in {pipeline_id}");
                    room.awareness.insert(session_id, encoded.clone());
                }
                AwarenessMessage::Leave { .. } => {
                    log::debug!("Session {session_id} cleared its presence in {pipeline_id}");
                    room.awareness.remove(&session_id);
                }
            }
        }
    }

    if let Some(group) = shared.room_manager.get(pipeline_id).await {
        group.broadcast_raw(encoded);
    }
    Ok(())
}

async fn leave_room(shared: &Arc<Shared>, session_id: Uuid, pipeline_id: &str) {
    let group = shared.room_manager.get(pipeline_id).await;
    if let Some(group) = &group {
        group.remove_peer(&session_id).await;
        if let Err(e) = group.broadcast(&SyncMessage::peer_left(session_id, pipeline_id)) {
            log::warn!("Failed to announce departure of {session_id}: {e}");
        }
    }

    let mut rooms = shared.rooms.write().await;
    if let Some(room) = rooms.get_mut(pipeline_id) {
        room.awareness.remove(&session_id);
    }
    log::info!("Session {session_id} left pipeline {pipeline_id}");

    if !shared.room_manager.remove_if_empty(pipeline_id).await {
        return;
    }
    if let Some(room) = rooms.remove(pipeline_id) {
        if let Some(store) = &shared.store {
            let key = document_key(pipeline_id);
            let compacted = store
                .current_version(&key)
                .and_then(|through| store.compact(&key, &room.encode_state(), through));
            match compacted {
                Ok(_) => {
                    shared.stats.write().await.persisted_snapshots += 1;
                    log::info!("Persisted pipeline {pipeline_id} (room closing)");
                }
                Err(e) => log::error!("Failed to persist pipeline {pipeline_id}: {e}"),
            }
        }
        log::info!("Room {pipeline_id} removed (empty)");
    }
    shared.stats.write().await.active_rooms = rooms.len();
}
