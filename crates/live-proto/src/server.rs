//! Frames received from the upstream endpoint.
//!
//! Inbound frames are decoded once into [`ServerMessage`] so callers match on
//! the variant instead of probing JSON fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AUDIO_OUTPUT_MIME_PREFIX;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// The endpoint accepted the setup frame.
    SetupComplete,
    /// A model turn carrying text and/or audio parts.
    ModelTurn(ModelTurnFrame),
    TurnComplete,
    Interrupted,
    /// Any shape this crate does not know about.
    Unknown,
}

/// Contents of one `serverContent.modelTurn` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelTurnFrame {
    /// All text parts concatenated in arrival order; `None` when the frame
    /// carried no non-empty text.
    pub text: Option<String>,
    /// Audio parts in arrival order.
    pub audio: Vec<InlineData>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl InlineData {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with(AUDIO_OUTPUT_MIME_PREFIX)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<RawServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    #[serde(default)]
    model_turn: Option<RawModelTurn>,
    #[serde(default)]
    turn_complete: Option<bool>,
    #[serde(default)]
    interrupted: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModelTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

pub fn decode(frame: &str) -> Result<ServerMessage, DecodeError> {
    let raw: RawFrame = serde_json::from_str(frame)?;
    Ok(classify(raw))
}

/// Binary frames carry the same JSON documents as text frames.
pub fn decode_slice(frame: &[u8]) -> Result<ServerMessage, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|_| DecodeError::NotUtf8)?;
    decode(text)
}

fn classify(raw: RawFrame) -> ServerMessage {
    if raw.setup_complete.is_some() {
        return ServerMessage::SetupComplete;
    }

    let Some(content) = raw.server_content else {
        return ServerMessage::Unknown;
    };

    if content.interrupted.unwrap_or(false) {
        return ServerMessage::Interrupted;
    }

    let turn_complete = content.turn_complete.unwrap_or(false);
    match content.model_turn {
        Some(turn) => ServerMessage::ModelTurn(collect_parts(turn, turn_complete)),
        None if turn_complete => ServerMessage::TurnComplete,
        None => ServerMessage::Unknown,
    }
}

fn collect_parts(turn: RawModelTurn, turn_complete: bool) -> ModelTurnFrame {
    let mut text = String::new();
    let mut audio = Vec::new();

    for part in turn.parts {
        // inlineData wins when a part carries both
        if let Some(inline) = part.inline_data {
            if inline.is_audio() {
                audio.push(inline);
            }
        } else if let Some(fragment) = part.text {
            text.push_str(&fragment);
        }
    }

    ModelTurnFrame {
        text: if text.is_empty() { None } else { Some(text) },
        audio,
        turn_complete,
    }
}
