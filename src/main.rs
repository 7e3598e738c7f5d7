// lens binary - process bootstrap
//
// Loads configuration, installs logging, wires the HTTP sender and event
// store into the proxy, then waits for Ctrl+C. Shutdown stops the HTTP
// server first so no new exchanges start, then stops the wire so in-flight
// saves can drain.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::oneshot;

use cli::{Cli, Commands};
use lens::config::Config;
use lens::proxy::{self, HttpSender, Wire, WireOptions};
use lens::{logging, storage};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Config { show, path } = cli.command() {
        return cli::handle_config(*show, *path);
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env()?;

    // The guard must be kept alive for the duration of the program to ensure logs flush
    let _log_guard = logging::init(&config.logging)?;

    let sender = Arc::new(HttpSender::new(
        config.api_url.clone(),
        Duration::from_secs(config.upstream_timeout_secs),
    )?);

    tracing::info!(
        upstream = %sender.base_url(),
        storage = %config.storage.backend,
        "lens {} starting",
        lens::config::VERSION
    );
    let saver = storage::build_saver(&config.storage)?;
    let wire = Arc::new(Wire::new(sender, saver, WireOptions::from_config(&config)));

    // Wire lifecycle: Running until the stop signal, then drains observers
    let (wire_stop_tx, wire_stop_rx) = oneshot::channel::<()>();
    let lifecycle_wire = wire.clone();
    let mut wire_handle = tokio::spawn(async move {
        lifecycle_wire
            .run(async move {
                wire_stop_rx.await.ok();
            })
            .await
    });

    // HTTP server, stopped through its own oneshot
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut proxy_handle = tokio::spawn(proxy::start_proxy(
        config.bind_addr,
        wire.clone(),
        shutdown_rx,
    ));

    let mut proxy_done = None;
    let mut wire_done = None;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Received Ctrl+C");
        }
        res = &mut proxy_handle => {
            proxy_done = Some(res);
        }
        res = &mut wire_handle => {
            wire_done = Some(res);
        }
    }

    tracing::info!("Shutting down...");

    // Stop accepting first; if the send fails the server is already gone
    let _ = shutdown_tx.send(());
    let proxy_result = match proxy_done {
        Some(res) => res,
        None => proxy_handle.await,
    };
    match proxy_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Proxy server error: {:#}", e),
        Err(e) => tracing::error!("Proxy server task failed: {}", e),
    }

    // Then drain in-flight observers
    let _ = wire_stop_tx.send(());
    let wire_result = match wire_done {
        Some(res) => res,
        None => wire_handle.await,
    };
    match wire_result {
        Ok(Ok(())) => tracing::info!("Shutdown complete"),
        Ok(Err(e)) => tracing::error!(pending = wire.in_flight(), "Wire stop failed: {}", e),
        Err(e) => tracing::error!("Wire task failed: {}", e),
    }

    Ok(())
}
