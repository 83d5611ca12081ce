// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Labwerk agent
//
// Entry point. Initialises logging, loads settings, wires the device
// registry into the print and scan pipelines and keeps one session to the
// controller alive until interrupted.

mod cli;
mod data_dir;
mod handler;
mod scanning;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use labwerk_core::config::AgentConfig;
use labwerk_core::error::Result;
use labwerk_core::{DeviceRegistry, NodeIdentity};
use labwerk_print::{CommandDriver, PrintPipeline, Spooler};
use labwerk_session::{SessionConfig, SessionManager};

use cli::Cli;
use handler::AgentMethods;
use scanning::ScanController;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging comes first so data-dir and settings messages are not lost;
    // `debug` from the settings file raises the level once it is known.
    let logging = tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.debug))
        .with_filter_reloading();
    let filter = logging.reload_handle();
    logging.init();

    let dir = data_dir::data_dir(cli.data_dir.as_deref());
    let config = match cli.load_config(&dir).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot start");
            return ExitCode::FAILURE;
        }
    };
    if config.debug && !cli.debug {
        if let Err(e) = filter.reload(log_filter(true)) {
            warn!(error = %e, "could not enable debug logging");
        }
    }

    match run(config, &dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent failed");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise debug or info.
fn log_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

async fn run(config: AgentConfig, dir: &std::path::Path) -> Result<()> {
    info!(name = %config.name, "Using device name");
    let identity = NodeIdentity::load_or_create(dir.join(data_dir::NODE_ID_FILE), &config.name);
    info!(node_id = %identity.id, devices = config.devices.len(), "agent starting");

    let registry = DeviceRegistry::new(config.devices.clone()).shared();
    let transport = labwerk_transport::from_settings(&config.host, config.port, &config.tls)?;

    let printer = PrintPipeline::new(
        registry.clone(),
        Arc::new(CommandDriver),
        Spooler::from_settings(&config.spool),
    );
    let methods = Arc::new(AgentMethods::new(identity, registry.clone(), printer));
    let scans = Arc::new(ScanController::new(registry, config.scanner.clone()));
    let session = SessionManager::new(SessionConfig::from(&config), transport, methods, scans);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "cannot listen for shutdown signals");
                return;
            }
            info!("shutting down");
            cancel.cancel();
        }
    });

    session.run_until(cancel).await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            r = tokio::signal::ctrl_c() => r?,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
