//! Wire types for the Live streaming protocol. The relay speaks this protocol
//! to the upstream generative endpoint. The shapes live in their own crate so
//! they can be encoded and decoded without pulling in the relay runtime.

pub mod client;
pub mod server;

pub use client::{
    ClientContent, ClientContentMessage, GenerationConfig, LiveConfig, MediaChunk,
    Modality, PrebuiltVoiceConfig, RealtimeInput, RealtimeInputMessage, SetupMessage,
    SpeechConfig, SystemInstruction, TextPart, Tool, Turn, VoiceConfig,
};
pub use server::{decode, decode_slice, DecodeError, InlineData, ModelTurnFrame, ServerMessage};

/// MIME type attached to outgoing microphone chunks.
pub const AUDIO_INPUT_MIME: &str = "audio/pcm;rate=16000";

/// MIME type attached to outgoing camera or screen frames.
pub const VIDEO_INPUT_MIME: &str = "image/jpeg";

/// Inline data parts whose MIME type starts with this prefix are audio output.
pub const AUDIO_OUTPUT_MIME_PREFIX: &str = "audio/pcm";
