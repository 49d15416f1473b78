use anyhow::Result;
use clap::Parser;
use sahayak_relay::{telemetry::Telemetry, Cli, RelayConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        endpoint = %config.live.endpoint,
        model = %config.live.model,
        handshake_timeout_secs = config.live.handshake_timeout.as_secs(),
        "starting sahayak-relay"
    );

    sahayak_relay::run(config, telemetry.metrics_handle()).await
}
