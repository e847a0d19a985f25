//! HL7 connection proxy
//!
//! Transparent TCP proxy for HL7 v2 over MLLP.
//!
//! This service:
//! - Accepts one EMR client connection at a time
//! - Dials the backend (forum) for every client session
//! - Optionally trims both directions to well-formed MLLP frames
//! - Optionally re-encodes payloads through external converters
//! - Optionally captures the client stream to a file

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use hl7_proxy::{logging, Args, ProxyError, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format);

    let config = args.into_config()?;

    info!("Starting HL7 proxy");
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        framing = config.framing,
        source_encoder = config.source_encoder.as_deref().unwrap_or(""),
        destination_encoder = config.destination_encoder.as_deref().unwrap_or(""),
        encoder_failure = %config.encoder_failure,
        capture_file = ?config.log_file,
        "Configuration loaded"
    );

    // The capture file starts empty on every run
    if let Some(path) = &config.log_file {
        tokio::fs::File::create(path)
            .await
            .map_err(|source| ProxyError::CaptureFile {
                path: path.clone(),
                source,
            })?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut supervisor = Supervisor::new(config, shutdown_rx)?;
    supervisor.bind().await?;

    let mut handle = tokio::spawn(supervisor.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);

            // An active session drains through its own teardown
            if let Err(e) = handle.await {
                error!(error = %e, "Supervisor task panicked");
                return Err(e.into());
            }
        }
        result = &mut handle => {
            if let Err(e) = result {
                error!(error = %e, "Supervisor task panicked");
                return Err(e.into());
            }
            info!("Supervisor exited");
        }
    }

    info!("HL7 proxy shutdown complete");
    Ok(())
}
