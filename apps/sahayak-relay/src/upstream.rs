//! Upstream protocol client: one WebSocket connection to the Live endpoint.
//!
//! Lifecycle is `Connecting -> Open -> Ready -> Closed | Failed`. `Open` means
//! the transport is up and the setup frame may be sent; `Ready` means the
//! endpoint acknowledged it. A client is never reconnected; callers build a
//! new one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use live_proto::{
    ClientContentMessage, DecodeError, LiveConfig, ModelTurnFrame, RealtimeInputMessage,
    ServerMessage, SetupMessage,
};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::events::{AudioChunk, Subscriptions};

/// Which half of a session a client serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    Text,
    Audio,
}

impl ClientRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientRole::Text => "text",
            ClientRole::Audio => "audio",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Ready,
    Closed,
    Failed,
}

impl LinkState {
    fn can_become(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closed)
                | (Connecting, Failed)
                | (Open, Ready)
                | (Open, Closed)
                | (Open, Failed)
                | (Ready, Closed)
                | (Ready, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

/// Address of the Live endpoint. The API key travels as a `key` query
/// parameter and is redacted from `Display`.
#[derive(Clone)]
pub struct LiveEndpoint {
    url: String,
    api_key: Option<String>,
}

impl LiveEndpoint {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn connect_url(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.url, separator, key)
            }
            None => self.url.clone(),
        }
    }
}

impl fmt::Display for LiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.api_key {
            Some(_) => write!(f, "{} (key=***)", self.url),
            None => f.write_str(&self.url),
        }
    }
}

impl fmt::Debug for LiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// State shared between the client handle and its read loop.
struct Shared {
    role: ClientRole,
    state: watch::Sender<LinkState>,
    last_error: Mutex<Option<String>>,
    subscriptions: Subscriptions,
}

impl Shared {
    fn new(role: ClientRole) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self {
            role,
            state,
            last_error: Mutex::new(None),
            subscriptions: Subscriptions::default(),
        }
    }

    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    fn transition(&self, next: LinkState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_become(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn fail(&self, reason: String) {
        warn!(role = %self.role, error = %reason, "upstream connection failed");
        *self.last_error.lock() = Some(reason.clone());
        if self.transition(LinkState::Failed) {
            self.subscriptions
                .emit_error(format!("Upstream connection error: {reason}"));
        }
    }

    /// Runs when the read loop ends on its own.
    fn finish(&self, reason: String) {
        match self.current() {
            // closed locally; nobody needs to hear about it
            LinkState::Closed => return,
            LinkState::Failed => {}
            _ => {
                self.transition(LinkState::Closed);
            }
        }
        info!(role = %self.role, reason = %reason, "upstream connection ended");
        self.subscriptions.emit_closed(reason);
    }

    fn handle_frame(&self, frame: Result<ServerMessage, DecodeError>) {
        let role = self.role.as_str();
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(role, error = %err, "dropping undecodable upstream frame");
                counter!("sahayak_upstream_frames_total", "role" => role, "kind" => "invalid").increment(1);
                return;
            }
        };

        match message {
            ServerMessage::SetupComplete => {
                counter!("sahayak_upstream_frames_total", "role" => role, "kind" => "setup_complete").increment(1);
                if self.transition(LinkState::Ready) {
                    info!(role, "upstream setup acknowledged");
                } else {
                    debug!(role, state = ?self.current(), "ignoring repeated setupComplete");
                }
            }
            ServerMessage::ModelTurn(turn) => {
                counter!("sahayak_upstream_frames_total", "role" => role, "kind" => "model_turn").increment(1);
                self.dispatch_turn(turn);
            }
            ServerMessage::TurnComplete => {
                counter!("sahayak_upstream_frames_total", "role" => role, "kind" => "turn_complete").increment(1);
                debug!(role, "upstream turn complete");
            }
            ServerMessage::Interrupted => {
                counter!("sahayak_upstream_frames_total", "role" => role, "kind" => "interrupted").increment(1);
                info!(role, "upstream turn interrupted");
            }
            ServerMessage::Unknown => {
                debug!(role, "ignoring unrecognised upstream frame");
            }
        }
    }

    fn dispatch_turn(&self, turn: ModelTurnFrame) {
        for inline in turn.audio {
            debug!(role = %self.role, bytes = inline.data.len(), "upstream audio chunk");
            let delivered = self.subscriptions.emit_audio(AudioChunk {
                mime_type: inline.mime_type,
                data: inline.data,
            });
            if !delivered {
                debug!(role = %self.role, "audio chunk dropped: no subscriber");
            }
        }

        if let Some(text) = turn.text {
            debug!(role = %self.role, chars = text.len(), "upstream text content");
            if !self.subscriptions.emit_content(text) {
                debug!(role = %self.role, "content dropped: no subscriber");
            }
        }

        if turn.turn_complete {
            debug!(role = %self.role, "upstream turn complete");
        }
    }
}

pub struct LiveClient {
    shared: Arc<Shared>,
    endpoint: LiveEndpoint,
    connect_started: AtomicBool,
    // Guards the outbound sender together with the task handles so `close`
    // cannot interleave with the tail of `connect`.
    io: Mutex<ClientIo>,
}

#[derive(Default)]
struct ClientIo {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveClient {
    pub fn new(endpoint: LiveEndpoint, role: ClientRole) -> Self {
        Self {
            shared: Arc::new(Shared::new(role)),
            endpoint,
            connect_started: AtomicBool::new(false),
            io: Mutex::new(ClientIo::default()),
        }
    }

    pub fn role(&self) -> ClientRole {
        self.shared.role
    }

    pub fn state(&self) -> LinkState {
        self.shared.current()
    }

    /// True while the transport is connected and not torn down.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), LinkState::Open | LinkState::Ready)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.shared.subscriptions
    }

    /// Opens the transport. Resolves once, when the socket is connected;
    /// a second call on the same client is an error.
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.connect_started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::transport(
                "connect already attempted on this client",
            ));
        }
        let role = self.shared.role;
        if self.state().is_terminal() {
            return Err(RelayError::transport(format!(
                "{role} client closed before connect"
            )));
        }
        debug!(%role, endpoint = %self.endpoint, "connecting to upstream");

        let (stream, _response) = match connect_async(self.endpoint.connect_url()).await {
            Ok(pair) => pair,
            Err(err) => {
                let reason = format!("connect failed: {err}");
                self.shared.fail(reason.clone());
                return Err(RelayError::Transport(reason));
            }
        };
        let (mut sink, mut source) = stream.split();

        let mut io = self.io.lock();
        if !self.shared.transition(LinkState::Open) {
            return Err(RelayError::transport(format!(
                "{role} client closed while connecting"
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    writer_shared.fail(format!("write failed: {err}"));
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!(role = %writer_shared.role, "upstream writer finished");
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        reader_shared.handle_frame(live_proto::decode(text.as_str()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        reader_shared.handle_frame(live_proto::decode_slice(&bytes));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "closed by upstream ({}): {}",
                                u16::from(frame.code),
                                frame.reason.as_str()
                            ),
                            None => "closed by upstream".to_string(),
                        };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        let reason = format!("read failed: {err}");
                        reader_shared.fail(reason.clone());
                        break reason;
                    }
                    None => break "upstream stream ended".to_string(),
                }
            };
            reader_shared.finish(reason);
        });

        io.outbound = Some(tx);
        io.writer = Some(writer);
        io.reader = Some(reader);
        drop(io);

        info!(%role, "upstream transport open");
        Ok(())
    }

    /// Sends the setup frame. Only valid between `connect` and the endpoint's
    /// acknowledgement.
    pub fn send_setup(&self, config: &LiveConfig) -> Result<(), RelayError> {
        let state = self.state();
        if state != LinkState::Open {
            return Err(RelayError::transport(format!(
                "cannot send setup on {} client in state {state:?}",
                self.shared.role
            )));
        }
        debug!(
            role = %self.shared.role,
            model = %config.model,
            modality = ?config.modality(),
            voice = ?config.voice_name(),
            "sending setup"
        );
        self.send_json(&SetupMessage {
            setup: config.clone(),
        })
    }

    /// Waits for `setupComplete`. Fails if the connection closes or fails
    /// first. Callers bound this with a timeout.
    pub async fn wait_ready(&self) -> Result<(), RelayError> {
        let mut state_rx = self.shared.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                LinkState::Ready => return Ok(()),
                LinkState::Closed | LinkState::Failed => {
                    let detail = self
                        .last_error()
                        .unwrap_or_else(|| "connection closed".to_string());
                    return Err(RelayError::Transport(format!(
                        "{} client {:?} before setup was acknowledged: {detail}",
                        self.shared.role, state
                    )));
                }
                LinkState::Connecting | LinkState::Open => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(RelayError::transport("client dropped during setup"));
            }
        }
    }

    pub fn send_audio_chunk(&self, base64_audio: impl Into<String>) -> Result<(), RelayError> {
        self.ensure_writable()?;
        self.send_json(&RealtimeInputMessage::audio(base64_audio))
    }

    pub fn send_video_frame(&self, base64_frame: impl Into<String>) -> Result<(), RelayError> {
        self.ensure_writable()?;
        self.send_json(&RealtimeInputMessage::video(base64_frame))
    }

    pub fn send_text(&self, text: impl Into<String>, turn_complete: bool) -> Result<(), RelayError> {
        self.ensure_writable()?;
        self.send_json(&ClientContentMessage::user_text(text, turn_complete))
    }

    /// Idempotent. Never blocks on in-flight writes.
    pub fn close(&self) {
        let mut io = self.io.lock();
        let was_live = self.shared.transition(LinkState::Closed);
        if let Some(tx) = io.outbound.take() {
            // The writer flushes the close frame and then exits.
            let _ = tx.send(Message::Close(None));
        }
        if let Some(reader) = io.reader.take() {
            reader.abort();
        }
        io.writer.take();
        drop(io);

        if was_live {
            info!(role = %self.shared.role, "upstream client closed");
        }
        self.shared.subscriptions.clear();
    }

    fn ensure_writable(&self) -> Result<(), RelayError> {
        match self.state() {
            LinkState::Open | LinkState::Ready => Ok(()),
            state => Err(RelayError::transport(format!(
                "{} client is {state:?}",
                self.shared.role
            ))),
        }
    }

    fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), RelayError> {
        let payload = serde_json::to_string(frame)?;
        let io = self.io.lock();
        let Some(tx) = io.outbound.as_ref() else {
            return Err(RelayError::transport(format!(
                "{} client has no open transport",
                self.shared.role
            )));
        };
        tx.send(Message::Text(payload.into())).map_err(|_| {
            RelayError::transport(format!("{} client writer has stopped", self.shared.role))
        })
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClient")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
