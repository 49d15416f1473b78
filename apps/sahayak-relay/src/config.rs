use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::orchestrator::LiveSettings;
use crate::presets::DEFAULT_TEACHER_INSTRUCTION;
use crate::upstream::LiveEndpoint;

pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

#[derive(Debug, Parser)]
#[command(
    name = "sahayak-relay",
    author,
    version,
    about = "Relays browser teaching sessions to the Gemini Live endpoint"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "SAHAYAK_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Live endpoint websocket URL.
    #[arg(long, env = "GEMINI_LIVE_URL", default_value = DEFAULT_LIVE_URL)]
    pub live_url: String,

    /// API key appended to the Live URL as `key`.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = "models/gemini-2.0-flash-exp")]
    pub model: String,

    /// Default persona for teacher sessions.
    #[arg(long, env = "SAHAYAK_TEACHER_SYSTEM_INSTRUCTION")]
    pub system_instruction: Option<String>,

    #[arg(long, env = "SAHAYAK_TEXT_VOICE", default_value = "Aoede")]
    pub text_voice: String,

    #[arg(long, env = "SAHAYAK_AUDIO_VOICE", default_value = "Puck")]
    pub audio_voice: String,

    /// Offer the Google Search tool to teacher sessions.
    #[arg(long, env = "SAHAYAK_GOOGLE_SEARCH", default_value_t = false)]
    pub google_search: bool,

    /// Upper bound on connect plus setup acknowledgement per upstream client.
    #[arg(long, env = "SAHAYAK_HANDSHAKE_TIMEOUT_SECS", default_value_t = 15)]
    pub handshake_timeout_secs: u64,

    /// Outbound envelopes above this size have their payload truncated.
    #[arg(long, env = "SAHAYAK_MAX_ENVELOPE_BYTES", default_value_t = 64_000)]
    pub max_envelope_bytes: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SAHAYAK_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub live: LiveSettings,
    pub max_envelope_bytes: usize,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let live_url = cli.live_url.trim();
        if !(live_url.starts_with("ws://") || live_url.starts_with("wss://")) {
            bail!("live url must use ws:// or wss://, got {live_url}");
        }
        if cli.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if cli.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be at least one second");
        }
        if cli.max_envelope_bytes == 0 {
            bail!("max envelope bytes must be positive");
        }

        let default_instruction = cli
            .system_instruction
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TEACHER_INSTRUCTION.to_string());

        Ok(RelayConfig {
            listen_addr,
            live: LiveSettings {
                endpoint: LiveEndpoint::new(live_url, cli.api_key),
                model: cli.model.trim().to_string(),
                default_instruction,
                text_voice: cli.text_voice,
                audio_voice: cli.audio_voice,
                google_search: cli.google_search,
                handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            },
            max_envelope_bytes: cli.max_envelope_bytes,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
