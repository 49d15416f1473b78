//! Session creation, routing and teardown.
//!
//! A session becomes visible in the registry only after every client it
//! needs has acknowledged setup. Any failure on the way closes whatever was
//! already opened, so a failed creation leaves nothing behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use live_proto::{LiveConfig, Modality};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::events::{AudioChunk, Callback};
use crate::presets::{FUTURE_PLANNER_INSTRUCTION, PROMPT_CREATOR_INSTRUCTION};
use crate::session::{LiveSession, SessionId, SessionKind, SessionRegistry};
use crate::upstream::{ClientRole, LiveClient, LiveEndpoint};

/// Upstream parameters shared by every session.
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub endpoint: LiveEndpoint,
    pub model: String,
    pub default_instruction: String,
    pub text_voice: String,
    pub audio_voice: String,
    pub google_search: bool,
    pub handshake_timeout: Duration,
}

/// An upstream client ended without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamClosed {
    pub role: ClientRole,
    pub reason: String,
}

/// Subscribers attached to every client of a session.
#[derive(Clone)]
pub struct SessionHandlers {
    pub on_audio: Callback<AudioChunk>,
    pub on_content: Callback<String>,
    pub on_error: Callback<String>,
    pub on_closed: Callback<UpstreamClosed>,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    registry: SessionRegistry,
    settings: Arc<LiveSettings>,
}

impl SessionOrchestrator {
    pub fn new(registry: SessionRegistry, settings: LiveSettings) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    /// Creates a session of the given kind. The custom instruction only
    /// applies to teacher sessions.
    pub async fn create(
        &self,
        kind: SessionKind,
        custom_instruction: Option<&str>,
    ) -> Result<SessionId, RelayError> {
        match kind {
            SessionKind::Teacher => self.create_session(custom_instruction).await,
            SessionKind::PromptCreator => self.create_prompt_creator_session().await,
            SessionKind::FuturePlanner => self.create_future_planner_session().await,
        }
    }

    /// Teacher session: one text client and one audio client. A blank custom
    /// instruction falls back to the configured default.
    pub async fn create_session(
        &self,
        custom_instruction: Option<&str>,
    ) -> Result<SessionId, RelayError> {
        let instruction = custom_instruction
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(self.settings.default_instruction.as_str());

        let text = self
            .teacher_config(Modality::Text, instruction)
            .with_voice(self.settings.text_voice.clone());
        let audio = self
            .teacher_config(Modality::Audio, instruction)
            .with_voice(self.settings.audio_voice.clone());
        self.open_session(SessionKind::Teacher, text, Some(audio))
            .await
    }

    pub async fn create_prompt_creator_session(&self) -> Result<SessionId, RelayError> {
        let config = LiveConfig::new(self.settings.model.clone(), Modality::Text)
            .with_instruction(PROMPT_CREATOR_INSTRUCTION);
        self.open_session(SessionKind::PromptCreator, config, None)
            .await
    }

    pub async fn create_future_planner_session(&self) -> Result<SessionId, RelayError> {
        let config = LiveConfig::new(self.settings.model.clone(), Modality::Text)
            .with_instruction(FUTURE_PLANNER_INSTRUCTION);
        self.open_session(SessionKind::FuturePlanner, config, None)
            .await
    }

    fn teacher_config(&self, modality: Modality, instruction: &str) -> LiveConfig {
        let config =
            LiveConfig::new(self.settings.model.clone(), modality).with_instruction(instruction);
        if self.settings.google_search {
            config.with_google_search()
        } else {
            config
        }
    }

    async fn open_session(
        &self,
        kind: SessionKind,
        text_config: LiveConfig,
        audio_config: Option<LiveConfig>,
    ) -> Result<SessionId, RelayError> {
        let id = SessionId::new();
        info!(session_id = %id, kind = %kind, "creating session");

        let opened = match audio_config {
            Some(audio_config) => {
                let (text, audio) = tokio::join!(
                    self.open_client(id, ClientRole::Text, &text_config),
                    self.open_client(id, ClientRole::Audio, &audio_config),
                );
                match (text, audio) {
                    (Ok(text), Ok(audio)) => Ok((text, Some(audio))),
                    (Ok(survivor), Err(err)) | (Err(err), Ok(survivor)) => {
                        survivor.close();
                        Err(err)
                    }
                    (Err(err), Err(_)) => Err(err),
                }
            }
            None => self
                .open_client(id, ClientRole::Text, &text_config)
                .await
                .map(|text| (text, None)),
        };

        match opened {
            Ok((text, audio)) => {
                self.registry
                    .insert(LiveSession::new(id, kind, text, audio));
                counter!("sahayak_sessions_created_total", "kind" => kind.as_str()).increment(1);
                info!(session_id = %id, kind = %kind, "session ready");
                Ok(id)
            }
            Err(err) => {
                counter!(
                    "sahayak_sessions_failed_total",
                    "reason" => err.metric_label()
                )
                .increment(1);
                warn!(session_id = %id, kind = %kind, error = %err, "session creation failed");
                Err(err)
            }
        }
    }

    /// Connect, send setup and wait for the acknowledgement, all under the
    /// handshake timeout. The client is closed on any failure.
    async fn open_client(
        &self,
        session: SessionId,
        role: ClientRole,
        config: &LiveConfig,
    ) -> Result<LiveClient, RelayError> {
        let limit = self.settings.handshake_timeout;
        let client = LiveClient::new(self.settings.endpoint.clone(), role);
        let started = Instant::now();

        let handshake = async {
            client.connect().await?;
            client.send_setup(config)?;
            client.wait_ready().await
        };
        let outcome = tokio::time::timeout(limit, handshake).await;

        match outcome {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                histogram!("sahayak_handshake_duration_ms", "role" => role.as_str())
                    .record(elapsed.as_secs_f64() * 1000.0);
                debug!(session_id = %session, %role, elapsed_ms = elapsed.as_millis() as u64, "client ready");
                Ok(client)
            }
            Ok(Err(err)) => {
                client.close();
                Err(err)
            }
            Err(_) => {
                client.close();
                Err(RelayError::HandshakeTimeout(limit))
            }
        }
    }

    /// Attaches downstream subscribers to every client of the session. Fails
    /// when the session is already degraded, since a close that happened
    /// before wiring would otherwise go unnoticed.
    pub fn wire_session(
        &self,
        id: &SessionId,
        handlers: &SessionHandlers,
    ) -> Result<(), RelayError> {
        let session = self.lookup(id)?;
        attach(id, session.text_client(), handlers);
        if let Some(audio) = session.audio_client() {
            attach(id, audio, handlers);
        }
        ensure_active(&session)
    }

    pub fn send_text(&self, id: &SessionId, text: &str) -> Result<(), RelayError> {
        self.route("text", || {
            if text.trim().is_empty() {
                return Err(RelayError::InvalidPayload("text is empty".into()));
            }
            let session = self.lookup(id)?;
            ensure_active(&session)?;
            session.text_client().send_text(text, true)
        })
    }

    pub fn send_audio(&self, id: &SessionId, base64_audio: &str) -> Result<(), RelayError> {
        self.route("audio", || {
            validate_media(base64_audio)?;
            let session = self.lookup(id)?;
            let audio = media_client(&session)?;
            audio.send_audio_chunk(base64_audio)
        })
    }

    pub fn send_video(&self, id: &SessionId, base64_frame: &str) -> Result<(), RelayError> {
        self.route("video", || {
            validate_media(base64_frame)?;
            let session = self.lookup(id)?;
            let audio = media_client(&session)?;
            audio.send_video_frame(base64_frame)
        })
    }

    fn route(
        &self,
        channel: &'static str,
        send: impl FnOnce() -> Result<(), RelayError>,
    ) -> Result<(), RelayError> {
        let result = send();
        if let Err(err) = &result {
            counter!(
                "sahayak_routing_failures_total",
                "reason" => err.metric_label(),
                "channel" => channel
            )
            .increment(1);
            debug!(channel, error = %err, "routing failed");
        }
        result
    }

    pub fn set_screen_sharing(&self, id: &SessionId, active: bool) -> Result<(), RelayError> {
        let session = self.lookup(id)?;
        let previous = session.set_screen_sharing(active);
        if previous != active {
            info!(session_id = %id, active, "screen sharing changed");
        }
        Ok(())
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<LiveSession>> {
        self.registry.get(id)
    }

    pub fn is_session_active(&self, id: &SessionId) -> bool {
        self.registry
            .get(id)
            .map(|session| session.is_active())
            .unwrap_or(false)
    }

    pub fn get_all_sessions_status(&self) -> BTreeMap<SessionId, String> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|session| (session.id(), session.status_string()))
            .collect()
    }

    /// Idempotent. Returns whether a session was removed by this call.
    pub fn close_session(&self, id: &SessionId) -> bool {
        match self.registry.remove(id) {
            Some(session) => {
                session.close();
                info!(session_id = %id, kind = %session.kind(), "session closed");
                true
            }
            None => {
                debug!(session_id = %id, "close requested for unknown session");
                false
            }
        }
    }

    /// Closes every remaining session. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let sessions = self.registry.drain();
        for session in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            info!(closed = sessions.len(), "closed remaining sessions");
        }
        sessions.len()
    }

    fn lookup(&self, id: &SessionId) -> Result<Arc<LiveSession>, RelayError> {
        self.registry
            .get(id)
            .ok_or(RelayError::SessionNotFound(*id))
    }
}

fn ensure_active(session: &LiveSession) -> Result<(), RelayError> {
    if session.is_active() {
        Ok(())
    } else {
        Err(RelayError::SessionDegraded {
            session: session.id(),
            reason: session.status_string(),
        })
    }
}

fn media_client(session: &LiveSession) -> Result<&LiveClient, RelayError> {
    ensure_active(session)?;
    session
        .audio_client()
        .ok_or_else(|| RelayError::SessionDegraded {
            session: session.id(),
            reason: format!("{} sessions do not accept media", session.kind()),
        })
}

fn validate_media(data: &str) -> Result<(), RelayError> {
    if data.is_empty() {
        return Err(RelayError::InvalidPayload("media payload is empty".into()));
    }
    STANDARD
        .decode(data)
        .map(|_| ())
        .map_err(|err| RelayError::InvalidPayload(format!("media is not base64: {err}")))
}

fn attach(session: &SessionId, client: &LiveClient, handlers: &SessionHandlers) {
    let subscriptions = client.subscriptions();
    let role = client.role();

    let on_audio = Arc::clone(&handlers.on_audio);
    let on_content = Arc::clone(&handlers.on_content);
    let on_error = Arc::clone(&handlers.on_error);
    let on_closed = Arc::clone(&handlers.on_closed);

    let replaced = [
        subscriptions.on_audio(move |chunk| on_audio(chunk)),
        subscriptions.on_content(move |text| on_content(text)),
        subscriptions.on_error(move |message| on_error(message)),
        subscriptions.on_closed(move |reason| on_closed(UpstreamClosed { role, reason })),
    ];
    if replaced.iter().any(|was_wired| *was_wired) {
        warn!(session_id = %session, %role, "replaced existing subscribers");
    }
}
