// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP server for daemon mode

use std::net::SocketAddr;

use anyhow::{Context, Result};
use teamgrid_core::domain::node_config::NodeConfigManifest;
use teamgrid_core::TeamgridNode;
use tokio::signal;
use tracing::{error, info};

/// Build the node from a validated config and serve it until shutdown.
pub async fn start_daemon(config: NodeConfigManifest) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    let bind_addr: SocketAddr = format!(
        "{}:{}",
        config.spec.network.bind_address, config.spec.network.port
    )
    .parse()
    .with_context(|| {
        format!(
            "Invalid bind address {}:{}",
            config.spec.network.bind_address, config.spec.network.port
        )
    })?;

    info!(
        node_id = %config.spec.node.id,
        base_url = %config.spec.node.base_url,
        "teamgrid daemon starting (PID: {})",
        std::process::id()
    );

    let node = TeamgridNode::build(config).context("Failed to assemble node")?;
    node.start_background_tasks();

    let app = node.router();
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    info!("HTTP server listening on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    node.stop_background_tasks().await;
    info!("Daemon shutting down");

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
