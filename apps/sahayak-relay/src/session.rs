use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::upstream::LiveClient;

/// Opaque session token. Freshly generated per session and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// Text and audio clients.
    Teacher,
    /// Single text client deriving a reusable instruction.
    PromptCreator,
    /// Single text client gathering career-planning details.
    FuturePlanner,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Teacher => "teacher",
            SessionKind::PromptCreator => "prompt-creator",
            SessionKind::FuturePlanner => "future-planner",
        }
    }

    pub fn has_audio(self) -> bool {
        matches!(self, SessionKind::Teacher)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical session owning its upstream clients.
#[derive(Debug)]
pub struct LiveSession {
    id: SessionId,
    kind: SessionKind,
    text: LiveClient,
    audio: Option<LiveClient>,
    screen_sharing: AtomicBool,
    created_at: OffsetDateTime,
}

impl LiveSession {
    pub fn new(id: SessionId, kind: SessionKind, text: LiveClient, audio: Option<LiveClient>) -> Self {
        Self {
            id,
            kind,
            text,
            audio,
            screen_sharing: AtomicBool::new(false),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn text_client(&self) -> &LiveClient {
        &self.text
    }

    pub fn audio_client(&self) -> Option<&LiveClient> {
        self.audio.as_ref()
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Every client the session kind requires is open.
    pub fn is_active(&self) -> bool {
        let audio_ok = match (&self.audio, self.kind.has_audio()) {
            (Some(audio), true) => audio.is_open(),
            (None, true) => false,
            (_, false) => true,
        };
        self.text.is_open() && audio_ok
    }

    /// `TEXT:ACTIVE, AUDIO:CLOSED` style summary, one flag per client.
    pub fn status_string(&self) -> String {
        let audio = match &self.audio {
            Some(client) => open_label(client.is_open()),
            None => "NONE",
        };
        format!("TEXT:{}, AUDIO:{}", open_label(self.text.is_open()), audio)
    }

    pub fn screen_sharing(&self) -> bool {
        self.screen_sharing.load(Ordering::Relaxed)
    }

    pub fn set_screen_sharing(&self, active: bool) -> bool {
        self.screen_sharing.swap(active, Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.text.close();
        if let Some(audio) = &self.audio {
            audio.close();
        }
    }
}

fn open_label(open: bool) -> &'static str {
    if open {
        "ACTIVE"
    } else {
        "CLOSED"
    }
}

/// Concurrent map of live sessions. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<LiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: LiveSession) -> Arc<LiveSession> {
        let session = Arc::new(session);
        self.sessions.insert(session.id(), Arc::clone(&session));
        self.publish_gauge();
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<LiveSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<LiveSession>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            self.publish_gauge();
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Point-in-time copy; holds no shard locks once returned.
    pub fn snapshot(&self) -> Vec<Arc<LiveSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes every session and hands them back for closing.
    pub fn drain(&self) -> Vec<Arc<LiveSession>> {
        let drained: Vec<_> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, session)| session))
            .collect();
        self.publish_gauge();
        drained
    }

    fn publish_gauge(&self) {
        gauge!("sahayak_sessions_active").set(self.sessions.len() as f64);
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
