use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_dial::{Cli, LinePrinter, logging};
use relay_session::{SessionState, Transports, start};
use transport_webrtc::WebRtcMediaTransport;
use transport_websocket::{WebSocketConfig, WebSocketSignaling};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(SessionState::Closed) => ExitCode::SUCCESS,
        Ok(state) => {
            eprintln!("relay-dial: session ended {state}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("relay-dial: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<SessionState> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("configuring logging")?;
    tracing::debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let params = cli.session_params().context("building session parameters")?;
    let media = WebRtcMediaTransport::new(
        Arc::clone(&params.configuration),
        cli.ice.webrtc_config(),
    )
    .await
    .context("creating the peer connection")?;
    let signaling = WebSocketSignaling::new(WebSocketConfig::from_env());

    let handle = start(
        params,
        Transports::new(Arc::new(signaling), Arc::new(media)),
        Arc::new(LinePrinter::new(io::stdout())),
    )
    .context("starting the session")?;
    tracing::info!(session_id = %handle.id(), channel = %cli.channel, "dialing relay");

    let closed = handle.closed();
    tokio::pin!(closed);
    tokio::select! {
        state = &mut closed => return Ok(state),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::warn!(error = %err, "ctrl-c handler failed");
            }
            tracing::info!("interrupted; disconnecting");
            handle.disconnect();
        }
    }
    Ok(closed.await)
}
