// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ChitUI relay daemon.
//
// Entry point. Initialises logging and services, connects saved printers,
// serves the dashboard surface, and runs until Ctrl-C.

mod server;
mod services;

use std::process::ExitCode;

use chitui_core::config::BridgeConfig;
use tokio::net::TcpListener;

use services::app_services::AppServices;

#[tokio::main]
async fn main() -> ExitCode {
    let config = BridgeConfig::from_env();
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(port = config.port, "ChitUI relay starting");

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let svc = match AppServices::init(config) {
        Ok(svc) => svc,
        Err(e) => {
            tracing::error!(error = %e, "could not initialise services");
            return ExitCode::FAILURE;
        }
    };

    let event_log = svc.spawn_event_log();
    let reaper = svc.bridge.spawn_reaper();
    let connected = svc.start().await;
    tracing::info!(connected, "printers connecting");

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %bind_addr, error = %e, "could not bind dashboard port");
            svc.bridge.shutdown();
            reaper.abort();
            event_log.abort();
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for Ctrl-C");
        }
    };
    let served = server::serve(svc.clone(), listener, shutdown).await;

    tracing::info!("shutting down");
    svc.bridge.shutdown();
    reaper.abort();
    event_log.abort();
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "dashboard server failed");
            ExitCode::FAILURE
        }
    }
}
