//! Network sync provider: binds a [`PipelineDocument`] to a relay.
//!
//! ```text
//!            connect()                                 relay
//!   ┌───────────────────────┐   PeerJoined, SyncStep1   ┌─────┐
//!   │ SyncProvider          │ ────────────────────────► │     │
//!   │  writer task ◄─ mpsc  │ ◄──── SyncStep2, SyncStep1│     │
//!   │  reader task ─► doc   │ ────────────────► SyncStep2     │
//!   │  heartbeat task       │ ◄───────► Delta / Awareness     │
//!   └───────────────────────┘                           └─────┘
//! ```
//!
//! Local document updates are pushed as `Delta` frames while connected.
//! Edits made offline are not queued: the state-vector exchange on the next
//! `connect` carries them. Connection failures never retry on their own; the
//! caller observes `ConnectionStatus` events and decides.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use flowgraph_core::{
    AwarenessMessage, AwarenessTracker, CollabEvent, ConnectionStatus, EventBus, PipelineDocument,
    SinkId, UpdateOrigin,
};

use crate::protocol::{ConnectParams, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Provider timing.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Upper bound on establishing the WebSocket connection
    pub handshake_timeout: Duration,
    /// Remote presence silent for this long is dropped; local presence is
    /// re-announced at half this interval
    pub presence_idle_timeout: Duration,
}

impl ProviderConfig {
    /// Presence renewal period: half the idle timeout, never below 1ms.
    pub fn heartbeat_period(&self) -> Duration {
        (self.presence_idle_timeout / 2).max(Duration::from_millis(1))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            presence_idle_timeout: Duration::from_secs(30),
        }
    }
}

type Outgoing = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

/// State shared between the provider handle and its background tasks.
struct Link {
    doc: Arc<PipelineDocument>,
    presence: Arc<Mutex<AwarenessTracker>>,
    status: RwLock<ConnectionStatus>,
    synced: AtomicBool,
    outgoing: Outgoing,
    clock: AtomicU64,
    session_id: Uuid,
}

impl Link {
    fn bus(&self) -> &Arc<EventBus> {
        self.doc.bus()
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                return;
            }
            *current = status;
        }
        log::info!(
            "Pipeline {} connection {}",
            self.doc.pipeline_id(),
            status.as_str()
        );
        self.bus().emit(&CollabEvent::ConnectionStatus(status));
    }

    fn set_synced(&self, synced: bool) {
        if self.synced.swap(synced, Ordering::SeqCst) != synced {
            self.bus().emit(&CollabEvent::SyncStatus(synced));
        }
    }

    /// Queue a frame for the writer. Returns `false` when offline.
    fn send(&self, frame: &SyncMessage) -> bool {
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?} frame: {e}", frame.msg_type);
                return false;
            }
        };
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.send(encoded).is_ok(),
            None => false,
        }
    }

    fn send_awareness(&self, message: &AwarenessMessage) -> bool {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        match SyncMessage::awareness(self.session_id, self.doc.pipeline_id(), clock, message) {
            Ok(frame) => self.send(&frame),
            Err(e) => {
                log::error!("Failed to encode awareness: {e}");
                false
            }
        }
    }

    fn with_presence<R>(&self, f: impl FnOnce(&mut AwarenessTracker) -> R) -> R {
        let mut tracker = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut tracker)
    }

    fn emit_left(&self, departed: Vec<flowgraph_core::PresenceState>) {
        for state in departed {
            self.bus().emit(&CollabEvent::UserLeft(state));
        }
    }

    /// Tear down after the transport is gone.
    fn on_transport_closed(&self, status: ConnectionStatus) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.set_status(status);
        self.set_synced(false);
        let departed = self.with_presence(AwarenessTracker::clear_peers);
        self.emit_left(departed);
    }

    fn handle_frame(&self, frame: SyncMessage) {
        match frame.msg_type {
            MessageType::SyncStep1 => match self.doc.encode_diff(&frame.payload) {
                Ok(diff) => {
                    self.send(&SyncMessage::sync_step2(
                        self.session_id,
                        self.doc.pipeline_id(),
                        diff,
                    ));
                }
                Err(e) => log::warn!("Unreadable state vector from relay: {e}"),
            },

            MessageType::SyncStep2 => {
                match self.doc.apply_update(&frame.payload, UpdateOrigin::Remote) {
                    Ok(()) => self.set_synced(true),
                    Err(e) => log::warn!("Failed to apply initial state: {e}"),
                }
            }

            MessageType::Delta => {
                if frame.session_id == self.session_id {
                    return;
                }
                if let Err(e) = self.doc.apply_update(&frame.payload, UpdateOrigin::Remote) {
                    log::warn!("Dropping delta from {}: {e}", frame.session_id);
                }
            }

            MessageType::Awareness => match frame.awareness_message() {
                Ok(message) => {
                    let change = self.with_presence(|t| t.handle_message(&message));
                    if let Some(change) = change {
                        self.bus().emit(&change.into_event());
                    }
                }
                Err(e) => log::warn!("Dropping awareness from {}: {e}", frame.session_id),
            },

            MessageType::PeerJoined => {
                if let Ok(info) = frame.peer_info() {
                    log::debug!("{} ({}) joined {}", info.user_name, info.session_id, frame.pipeline_id);
                }
            }

            MessageType::PeerLeft => {
                let departed = self.with_presence(|t| t.remove_session(&frame.session_id));
                self.emit_left(departed.into_iter().collect());
            }

            MessageType::Ping => {
                self.send(&SyncMessage::pong(self.session_id));
            }

            MessageType::Pong => log::trace!("pong"),
        }
    }
}

/// WebSocket sync provider for one pipeline document.
pub struct SyncProvider {
    link: Arc<Link>,
    info: PeerInfo,
    config: ProviderConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    sink: SinkId,
}

impl SyncProvider {
    pub fn new(
        doc: Arc<PipelineDocument>,
        presence: Arc<Mutex<AwarenessTracker>>,
        user_name: &str,
        config: ProviderConfig,
    ) -> Self {
        let session_id = presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_id();
        let info = PeerInfo::new(session_id, doc.user_id(), user_name);

        let outgoing: Outgoing = Arc::new(Mutex::new(None));
        let clock = Arc::new(AtomicU64::new(0));
        let sink = {
            let outgoing = outgoing.clone();
            let pipeline_id = doc.pipeline_id().to_string();
            doc.on_update(move |update, origin| {
                if origin != UpdateOrigin::Local {
                    return;
                }
                let guard = outgoing.lock().unwrap_or_else(|e| e.into_inner());
                let Some(tx) = guard.as_ref() else {
                    return;
                };
                let seq = clock.fetch_add(1, Ordering::SeqCst) + 1;
                match SyncMessage::delta(session_id, &pipeline_id, seq, update.to_vec()).encode() {
                    Ok(bytes) => {
                        let _ = tx.send(bytes);
                    }
                    Err(e) => log::error!("Failed to encode delta: {e}"),
                }
            })
        };

        Self {
            link: Arc::new(Link {
                doc,
                presence,
                status: RwLock::new(ConnectionStatus::Disconnected),
                synced: AtomicBool::new(false),
                outgoing,
                clock: AtomicU64::new(0),
                session_id,
            }),
            info,
            config,
            tasks: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            sink,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.link.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_synced(&self) -> bool {
        self.link.synced.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Uuid {
        self.link.session_id
    }

    /// Connect to `{server_url}/{pipeline_id}?userId=..&userName=..` and start syncing.
    ///
    /// Resolves `false` (status `Error`) when the relay cannot be reached
    /// within the handshake timeout; never returns an error.
    pub async fn connect(&self, server_url: &str, pipeline_id: &str) -> bool {
        if pipeline_id != self.link.doc.pipeline_id() {
            log::error!(
                "Provider for pipeline {} cannot connect to {pipeline_id}",
                self.link.doc.pipeline_id()
            );
            self.link.set_status(ConnectionStatus::Error);
            return false;
        }
        if self.status() == ConnectionStatus::Connected {
            return true;
        }

        self.link.set_status(ConnectionStatus::Connecting);
        match self.open(server_url, pipeline_id).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Connecting pipeline {pipeline_id} to {server_url} failed: {e}");
                self.link.set_status(ConnectionStatus::Error);
                false
            }
        }
    }

    async fn open(&self, server_url: &str, pipeline_id: &str) -> Result<(), ProtocolError> {
        // Leftovers of a connection the relay closed on us.
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }

        let url = ConnectParams::new(self.info.user_id.as_str(), self.info.user_name.as_str())
            .url(server_url, pipeline_id);
        let (ws_stream, _) = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| {
            log::debug!("WebSocket connect to {url} failed: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.link.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(out_tx);

        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Handshake: identity, our state vector, our presence slot.
        let link = &self.link;
        link.send(&SyncMessage::peer_joined(pipeline_id, &self.info)?);
        link.send(&SyncMessage::sync_step1(
            link.session_id,
            pipeline_id,
            link.doc.state_vector(),
        ));
        let hello = link.with_presence(AwarenessTracker::local_message);
        link.send_awareness(&hello);

        link.set_status(ConnectionStatus::Connected);

        let reader = {
            let link = self.link.clone();
            tokio::spawn(async move {
                let mut status = ConnectionStatus::Disconnected;
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                            Ok(frame) => link.handle_frame(frame),
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Relay connection failed: {e}");
                            status = ConnectionStatus::Error;
                            break;
                        }
                    }
                }
                link.on_transport_closed(status);
            })
        };

        let heartbeat = {
            let link = self.link.clone();
            let idle = self.config.presence_idle_timeout;
            let period = self.config.heartbeat_period();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if *link.status.read().unwrap_or_else(|e| e.into_inner())
                        != ConnectionStatus::Connected
                    {
                        break;
                    }
                    let renew = link.with_presence(AwarenessTracker::local_message);
                    link.send_awareness(&renew);
                    let departed = link.with_presence(|t| t.cleanup_idle_peers(idle));
                    link.emit_left(departed);
                }
            })
        };

        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([reader, heartbeat]);
        Ok(())
    }

    /// Broadcast an awareness frame produced by the local tracker.
    /// Returns `false` while offline.
    pub fn send_awareness(&self, message: &AwarenessMessage) -> bool {
        self.link.send_awareness(message)
    }

    /// Announce departure, stop background tasks and drop remote presence.
    pub async fn disconnect(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        let leave = self.link.with_presence(|t| t.leave_message());
        self.link.send_awareness(&leave);
        self.link
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut writer) = writer {
            // Let the writer flush the leave frame and close the socket.
            if tokio::time::timeout(Duration::from_secs(1), &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }

        if self.status() != ConnectionStatus::Disconnected {
            self.link.on_transport_closed(ConnectionStatus::Disconnected);
        }
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.link.doc.remove_update_sink(self.sink);
        for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            writer.abort();
        }
    }
}
