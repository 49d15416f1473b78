//! Event subscriptions for an upstream client.
//!
//! Each client has one subscriber slot per event kind. Wiring replaces the
//! previous subscriber and returns whether one was present, so re-wiring is
//! visible to the caller. Events emitted while a slot is empty are dropped
//! and reported back as undelivered.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// One audio part from a model turn, still base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Audio,
    Content,
    Error,
    Closed,
}

struct Slot<T> {
    callback: RwLock<Option<Callback<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }

    fn replace(&self, callback: Callback<T>) -> bool {
        self.callback.write().replace(callback).is_some()
    }

    fn clear(&self) -> bool {
        self.callback.write().take().is_some()
    }

    fn is_set(&self) -> bool {
        self.callback.read().is_some()
    }

    fn emit(&self, value: T) -> bool {
        // Clone out of the lock so the callback never runs under it.
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }
}

pub struct Subscriptions {
    audio: Slot<AudioChunk>,
    content: Slot<String>,
    error: Slot<String>,
    closed: Slot<String>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self {
            audio: Slot::new(),
            content: Slot::new(),
            error: Slot::new(),
            closed: Slot::new(),
        }
    }
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("audio", &self.audio.is_set())
            .field("content", &self.content.is_set())
            .field("error", &self.error.is_set())
            .field("closed", &self.closed.is_set())
            .finish()
    }
}

impl Subscriptions {
    pub fn on_audio(&self, callback: impl Fn(AudioChunk) + Send + Sync + 'static) -> bool {
        self.audio.replace(Arc::new(callback))
    }

    pub fn on_content(&self, callback: impl Fn(String) + Send + Sync + 'static) -> bool {
        self.content.replace(Arc::new(callback))
    }

    pub fn on_error(&self, callback: impl Fn(String) + Send + Sync + 'static) -> bool {
        self.error.replace(Arc::new(callback))
    }

    /// Fires once when the connection ends without a local `close()`.
    pub fn on_closed(&self, callback: impl Fn(String) + Send + Sync + 'static) -> bool {
        self.closed.replace(Arc::new(callback))
    }

    pub fn is_wired(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Audio => self.audio.is_set(),
            EventKind::Content => self.content.is_set(),
            EventKind::Error => self.error.is_set(),
            EventKind::Closed => self.closed.is_set(),
        }
    }

    /// Drops every subscriber, breaking reference cycles through captured
    /// senders once a session is torn down.
    pub fn clear(&self) {
        self.audio.clear();
        self.content.clear();
        self.error.clear();
        self.closed.clear();
    }

    pub(crate) fn emit_audio(&self, chunk: AudioChunk) -> bool {
        self.audio.emit(chunk)
    }

    pub(crate) fn emit_content(&self, text: String) -> bool {
        self.content.emit(text)
    }

    pub(crate) fn emit_error(&self, message: String) -> bool {
        self.error.emit(message)
    }

    pub(crate) fn emit_closed(&self, reason: String) -> bool {
        self.closed.emit(reason)
    }
}
