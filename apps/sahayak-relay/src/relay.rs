//! Downstream relay handler: one task per browser WebSocket.
//!
//! A connection moves `Unbound -> Initializing -> Bound(session)` and back to
//! `Unbound` when its session is lost upstream. Session creation runs on a
//! separate task so the socket keeps being read while the handshake is in
//! flight. Teardown happens in one place, after the read loop ends.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::orchestrator::{SessionHandlers, SessionOrchestrator, UpstreamClosed};
use crate::session::{SessionId, SessionKind};

const NO_SESSION: &str = "No teacher session available";

/// Browser connection id to bound session. One session per connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    bindings: Arc<DashMap<Uuid, SessionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, connection: Uuid, session: SessionId) -> Option<SessionId> {
        self.bindings.insert(connection, session)
    }

    pub fn unbind(&self, connection: &Uuid) -> Option<SessionId> {
        self.bindings.remove(connection).map(|(_, session)| session)
    }

    pub fn session_for(&self, connection: &Uuid) -> Option<SessionId> {
        self.bindings.get(connection).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Everything a connection task needs from the application.
#[derive(Clone)]
pub struct RelayContext {
    pub orchestrator: SessionOrchestrator,
    pub connections: ConnectionRegistry,
    pub max_envelope_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Init {
        #[serde(default)]
        mode: Option<String>,
        #[serde(default, rename = "customPrompt")]
        custom_prompt: Option<String>,
    },
    Audio {
        data: String,
    },
    Video {
        data: String,
    },
    Text {
        data: String,
    },
    ScreenSharing {
        active: bool,
    },
}

const MESSAGE_TYPES: [&str; 5] = ["init", "audio", "video", "text", "screen-sharing"];

/// `error/unknown` for a well-formed message with an unrecognised `type`,
/// `error/payload` for anything else that failed to decode.
fn rejection(text: &str, err: &serde_json::Error) -> Envelope {
    let unknown = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type")?.as_str().map(str::to_owned))
        .filter(|kind| !MESSAGE_TYPES.contains(&kind.as_str()));
    match unknown {
        Some(kind) => Envelope::error("unknown", format!("Unknown message type: {kind}")),
        None => Envelope::error("payload", format!("Unsupported or malformed message: {err}")),
    }
}

fn session_kind(mode: Option<&str>) -> SessionKind {
    match mode.map(str::trim) {
        Some("prompt-creator") => SessionKind::PromptCreator,
        Some("future-planner") => SessionKind::FuturePlanner,
        _ => SessionKind::Teacher,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Unbound,
    Initializing,
    Bound(SessionId),
}

enum Control {
    Initialized(Result<SessionId, RelayError>),
    UpstreamClosed(SessionId, UpstreamClosed),
}

pub async fn serve_connection(socket: WebSocket, ctx: RelayContext) {
    let connection_id = Uuid::new_v4();
    let span = info_span!("browser_connection", connection_id = %connection_id);
    relay_connection(socket, ctx, connection_id)
        .instrument(span)
        .await;
}

async fn relay_connection(socket: WebSocket, ctx: RelayContext, connection_id: Uuid) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();

    let max_bytes = ctx.max_envelope_bytes;
    let writer = tokio::spawn(
        async move {
            while let Some(envelope) = out_rx.recv().await {
                let frame = match envelope.encode_bounded(max_bytes) {
                    Ok((frame, _)) => frame,
                    Err(err) => {
                        warn!(error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!("writer task finished");
        }
        .in_current_span(),
    );

    info!("browser connected");
    let mut connection = Connection {
        id: connection_id,
        ctx,
        out: out_tx,
        control: control_tx,
        binding: Binding::Unbound,
        init_task: None,
    };
    connection.push(Envelope::connection_success(
        "WebSocket connected - waiting for initialization",
    ));

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => connection.handle_text(&text),
                Some(Ok(Message::Binary(_))) => {
                    connection.push(Envelope::error("payload", "Binary frames are not supported"));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame.map(|f| f.reason.to_string()), "browser closed websocket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "error receiving browser message");
                    break;
                }
                None => break,
            },
            Some(control) = control_rx.recv() => connection.handle_control(control),
        }
    }

    connection.teardown(&mut control_rx).await;
    drop(connection);
    writer.abort();
    info!("browser connection closed");
}

struct Connection {
    id: Uuid,
    ctx: RelayContext,
    out: mpsc::UnboundedSender<Envelope>,
    control: mpsc::UnboundedSender<Control>,
    binding: Binding,
    init_task: Option<JoinHandle<()>>,
}

impl Connection {
    fn push(&self, envelope: Envelope) {
        if self.out.send(envelope).is_err() {
            debug!("dropping envelope: writer has stopped");
        }
    }

    fn handle_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "rejecting browser message");
                self.push(rejection(text, &err));
                return;
            }
        };

        match message {
            ClientMessage::Init {
                mode,
                custom_prompt,
            } => self.begin_init(session_kind(mode.as_deref()), custom_prompt),
            ClientMessage::Audio { data } => {
                self.route(|orchestrator, id| orchestrator.send_audio(id, &data))
            }
            ClientMessage::Video { data } => {
                self.route(|orchestrator, id| orchestrator.send_video(id, &data))
            }
            ClientMessage::Text { data } => {
                self.route(|orchestrator, id| orchestrator.send_text(id, &data))
            }
            ClientMessage::ScreenSharing { active } => {
                self.route(|orchestrator, id| orchestrator.set_screen_sharing(id, active))
            }
        }
    }

    fn begin_init(&mut self, kind: SessionKind, custom_prompt: Option<String>) {
        if self.binding != Binding::Unbound {
            warn!(state = ?self.binding, "rejecting repeated init");
            self.push(Envelope::error(
                "init",
                "Session already initialized for this connection",
            ));
            return;
        }

        info!(kind = %kind, custom_prompt = custom_prompt.is_some(), "initializing session");
        self.binding = Binding::Initializing;
        let orchestrator = self.ctx.orchestrator.clone();
        let control = self.control.clone();
        self.init_task = Some(tokio::spawn(
            async move {
                let result = orchestrator.create(kind, custom_prompt.as_deref()).await;
                let _ = control.send(Control::Initialized(result));
            }
            .in_current_span(),
        ));
    }

    fn route(&mut self, send: impl FnOnce(&SessionOrchestrator, &SessionId) -> Result<(), RelayError>) {
        let Binding::Bound(id) = self.binding else {
            self.push(Envelope::error("session", NO_SESSION));
            return;
        };

        if let Err(err) = send(&self.ctx.orchestrator, &id) {
            self.push(Envelope::error(err.envelope_sub_type(), err.to_string()));
            if matches!(err, RelayError::SessionNotFound(_)) {
                // Closed elsewhere; allow a fresh init.
                self.ctx.connections.unbind(&self.id);
                self.binding = Binding::Unbound;
            }
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Initialized(result) => {
                self.init_task = None;
                self.finish_init(result);
            }
            Control::UpstreamClosed(id, closed) => {
                if self.binding != Binding::Bound(id) {
                    debug!(session_id = %id, "ignoring close from stale session");
                    return;
                }
                warn!(session_id = %id, role = %closed.role, reason = %closed.reason, "upstream closed; tearing down session");
                self.push(Envelope::error(
                    "upstream",
                    format!(
                        "Upstream {} connection closed: {}",
                        closed.role, closed.reason
                    ),
                ));
                self.release(id);
            }
        }
    }

    fn finish_init(&mut self, result: Result<SessionId, RelayError>) {
        let id = match result {
            Ok(id) => id,
            Err(err) => {
                self.binding = Binding::Unbound;
                self.push(Envelope::connection_error(format!(
                    "Failed to initialize session: {err}"
                )));
                return;
            }
        };

        if !self.ctx.orchestrator.is_session_active(&id) {
            warn!(session_id = %id, "session lost before wiring");
            self.ctx.orchestrator.close_session(&id);
            self.binding = Binding::Unbound;
            self.push(Envelope::connection_error(
                "Failed to initialize session: upstream closed during setup",
            ));
            return;
        }

        // Success goes out before any content can be queued behind it.
        self.push(Envelope::connection_success(format!(
            "Session initialized: {id}"
        )));

        let handlers = self.handlers(id);
        if let Err(err) = self.ctx.orchestrator.wire_session(&id, &handlers) {
            warn!(session_id = %id, error = %err, "session degraded while wiring");
            self.push(Envelope::error(err.envelope_sub_type(), err.to_string()));
            self.release(id);
            return;
        }

        self.ctx.connections.bind(self.id, id);
        self.binding = Binding::Bound(id);
        info!(session_id = %id, "connection bound to session");
    }

    fn handlers(&self, id: SessionId) -> SessionHandlers {
        let audio_out = self.out.clone();
        let content_out = self.out.clone();
        let error_out = self.out.clone();
        let control = self.control.clone();
        SessionHandlers {
            on_audio: Arc::new(move |chunk| {
                let _ = audio_out.send(Envelope::audio(chunk.data));
            }),
            on_content: Arc::new(move |text| {
                let _ = content_out.send(Envelope::content(text));
            }),
            on_error: Arc::new(move |message| {
                let _ = error_out.send(Envelope::error("teacher", message));
            }),
            on_closed: Arc::new(move |closed| {
                let _ = control.send(Control::UpstreamClosed(id, closed));
            }),
        }
    }

    fn release(&mut self, id: SessionId) {
        self.ctx.orchestrator.close_session(&id);
        self.ctx.connections.unbind(&self.id);
        self.binding = Binding::Unbound;
    }

    /// The single cleanup path. A session still being created is awaited
    /// and closed so it cannot outlive the connection.
    async fn teardown(&mut self, control_rx: &mut mpsc::UnboundedReceiver<Control>) {
        match self.binding {
            Binding::Bound(id) => {
                info!(session_id = %id, "closing session for departed browser");
                self.release(id);
            }
            Binding::Initializing => {
                if let Some(task) = self.init_task.take() {
                    let _ = task.await;
                }
                while let Ok(control) = control_rx.try_recv() {
                    if let Control::Initialized(Ok(id)) = control {
                        info!(session_id = %id, "closing session created after browser left");
                        self.ctx.orchestrator.close_session(&id);
                    }
                }
                self.binding = Binding::Unbound;
            }
            Binding::Unbound => {}
        }
        self.ctx.connections.unbind(&self.id);
    }
}
