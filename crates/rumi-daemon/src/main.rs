// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon entrypoint.

use anyhow::Context;
use rumi_core::KernelConfig;
use rumi_daemon::{AppState, NullFlowRunner};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = KernelConfig::from_env();
    let state = AppState::initialize(config, Arc::new(NullFlowRunner))
        .context("initialize kernel state")?;

    // Approved packs get their egress sockets back on startup.
    for record in state.approval.list_packs() {
        if record.status == rumi_approval::PackStatus::Approved {
            if let Err(e) = state.ensure_egress_socket(&record.pack_id) {
                tracing::warn!(pack_id = %record.pack_id, error = %e, "egress socket restore failed");
            }
        }
    }

    let bind = std::env::var("RUMI_API_BIND").unwrap_or_else(|_| "127.0.0.1:8787".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "control-plane listening");

    let app = rumi_daemon::router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve")?;

    state.audit.flush();
    Ok(())
}
