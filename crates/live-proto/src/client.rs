//! Frames sent from the relay to the upstream endpoint.

use serde::{Deserialize, Serialize};

use crate::{AUDIO_INPUT_MIME, VIDEO_INPUT_MIME};

/// Response modality requested in the setup frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Audio => "audio",
        }
    }
}

/// First frame on every upstream connection: `{"setup": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupMessage {
    pub setup: LiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

impl LiveConfig {
    pub fn new(model: impl Into<String>, modality: Modality) -> Self {
        Self {
            model: model.into(),
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: modality,
                speech_config: None,
            }),
            tools: None,
        }
    }

    /// Blank instructions are dropped rather than sent as an empty part.
    pub fn with_instruction(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.system_instruction = Some(SystemInstruction {
                parts: vec![TextPart { text }],
            });
        }
        self
    }

    pub fn with_voice(mut self, voice_name: impl Into<String>) -> Self {
        if let Some(generation) = self.generation_config.as_mut() {
            generation.speech_config = Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice_name.into(),
                    },
                },
            });
        }
        self
    }

    pub fn with_google_search(mut self) -> Self {
        self.tools
            .get_or_insert_with(Vec::new)
            .push(Tool::google_search());
        self
    }

    pub fn modality(&self) -> Option<Modality> {
        self.generation_config
            .as_ref()
            .map(|generation| generation.response_modalities)
    }

    pub fn voice_name(&self) -> Option<&str> {
        self.generation_config
            .as_ref()
            .and_then(|generation| generation.speech_config.as_ref())
            .map(|speech| speech.voice_config.prebuilt_voice_config.voice_name.as_str())
    }

    pub fn instruction_text(&self) -> Option<&str> {
        self.system_instruction
            .as_ref()
            .and_then(|instruction| instruction.parts.first())
            .map(|part| part.text.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Modality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub google_search: serde_json::Map<String, serde_json::Value>,
}

impl Tool {
    pub fn google_search() -> Self {
        Self {
            google_search: serde_json::Map::new(),
        }
    }
}

/// `{"realtimeInput": {"mediaChunks": [...]}}`, used for audio and video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

impl RealtimeInputMessage {
    pub fn audio(base64_data: impl Into<String>) -> Self {
        Self::single(AUDIO_INPUT_MIME, base64_data)
    }

    pub fn video(base64_data: impl Into<String>) -> Self {
        Self::single(VIDEO_INPUT_MIME, base64_data)
    }

    fn single(mime_type: &str, data: impl Into<String>) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: mime_type.to_string(),
                    data: data.into(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

/// `{"clientContent": {"turns": [...], "turnComplete": bool}}`, used for text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub client_content: ClientContent,
}

impl ClientContentMessage {
    pub fn user_text(text: impl Into<String>, turn_complete: bool) -> Self {
        Self {
            client_content: ClientContent {
                turns: vec![Turn {
                    role: "user".to_string(),
                    parts: vec![TextPart { text: text.into() }],
                }],
                turn_complete,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<TextPart>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_frame_matches_wire_shape() {
        let config = LiveConfig::new("models/gemini-2.0-flash-exp", Modality::Audio)
            .with_instruction("Be kind")
            .with_voice("Puck");
        let value = serde_json::to_value(SetupMessage { setup: config }).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-2.0-flash-exp",
                    "systemInstruction": { "parts": [{ "text": "Be kind" }] },
                    "generationConfig": {
                        "responseModalities": "audio",
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn blank_instruction_is_omitted() {
        let config = LiveConfig::new("m", Modality::Text).with_instruction("   ");
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("systemInstruction").is_none());
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn google_search_tool_serializes_as_empty_object() {
        let config = LiveConfig::new("m", Modality::Text).with_google_search();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["tools"], json!([{ "googleSearch": {} }]));
    }

    #[test]
    fn media_and_text_frames_use_distinct_envelopes() {
        let audio = serde_json::to_value(RealtimeInputMessage::audio("AAAA")).unwrap();
        assert_eq!(
            audio,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAAA" }]
                }
            })
        );

        let video = serde_json::to_value(RealtimeInputMessage::video("/9j/")).unwrap();
        assert_eq!(
            video["realtimeInput"]["mediaChunks"][0]["mimeType"],
            json!("image/jpeg")
        );

        let text = serde_json::to_value(ClientContentMessage::user_text("hi", true)).unwrap();
        assert_eq!(
            text,
            json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                    "turnComplete": true
                }
            })
        );
    }
}
