//! Uniform `{type, subType, data, timestamp}` frames sent to the browser.

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Connection,
    Audio,
    Content,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sub_type: String,
    pub data: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, sub_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind,
            sub_type: sub_type.into(),
            data: data.into(),
            timestamp: now_millis(),
        }
    }

    pub fn connection_success(message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Connection, "success", message)
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Connection, "error", message)
    }

    pub fn audio(base64_audio: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Audio, "data", base64_audio)
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Content, "text", text)
    }

    pub fn error(sub_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Error, sub_type, message)
    }

    /// Serializes the envelope, truncating `data` with a trailing `...` when
    /// the frame would exceed `max_bytes`. Audio is never truncated. Returns
    /// the frame and whether it was shortened.
    pub fn encode_bounded(&self, max_bytes: usize) -> Result<(String, bool), serde_json::Error> {
        let encoded = serde_json::to_string(self)?;
        if encoded.len() <= max_bytes || self.kind == EnvelopeKind::Audio {
            return Ok((encoded, false));
        }

        let mut shortened = self.clone();
        let mut keep = self.data.len();
        let mut frame = encoded;
        while frame.len() > max_bytes && keep > 0 {
            let excess = frame.len() - max_bytes + ELLIPSIS.len();
            keep = floor_char_boundary(&self.data, keep.saturating_sub(excess));
            shortened.data.clear();
            shortened.data.push_str(&self.data[..keep]);
            shortened.data.push_str(ELLIPSIS);
            frame = serde_json::to_string(&shortened)?;
        }

        counter!("sahayak_envelopes_truncated_total", "type" => self.kind.as_str()).increment(1);
        warn!(
            kind = self.kind.as_str(),
            original_bytes = self.data.len(),
            kept_bytes = keep,
            "outbound envelope truncated"
        );
        Ok((frame, true))
    }
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Connection => "connection",
            EnvelopeKind::Audio => "audio",
            EnvelopeKind::Content => "content",
            EnvelopeKind::Error => "error",
        }
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
