//! Real-time relay between browser WebSocket clients and the Gemini Live
//! endpoint. Each teacher session holds two upstream connections, one for
//! text responses and one for audio, behind a single browser connection.

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod presets;
pub mod relay;
pub mod routes;
pub mod session;
pub mod telemetry;
pub mod upstream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

pub use config::{Cli, RelayConfig};
pub use error::RelayError;
pub use orchestrator::{LiveSettings, SessionHandlers, SessionOrchestrator, UpstreamClosed};
pub use relay::{ConnectionRegistry, RelayContext};
pub use routes::{router, AppState};
pub use session::{LiveSession, SessionId, SessionKind, SessionRegistry};

/// Builds the shared state for a relay process.
pub fn app_state(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Arc<AppState> {
    let orchestrator = SessionOrchestrator::new(SessionRegistry::new(), config.live.clone());
    Arc::new(AppState {
        relay: RelayContext {
            orchestrator,
            connections: ConnectionRegistry::new(),
            max_envelope_bytes: config.max_envelope_bytes,
        },
        metrics,
    })
}

pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let state = app_state(&config, Some(metrics));
    serve(listener, state, config.shutdown_grace, shutdown_signal()).await
}

/// Serves on an already bound listener until `shutdown` resolves, then
/// closes every remaining session.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_grace: Duration,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(Arc::clone(&state));

    let local_addr = listener.local_addr().context("listener has no address")?;
    info!(listen_addr = %local_addr, "sahayak-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    let closed = state.relay.orchestrator.shutdown();
    info!(
        closed_sessions = closed,
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
