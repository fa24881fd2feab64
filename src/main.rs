// =============================================================================
// Perpetual-futures execution & reconciliation engine — entry point
// =============================================================================
//
// Every profile starts whatever `engine_config.json` says (environment,
// active flag); there is no forced safe-mode override here because each
// profile already carries its own `environment` (Live/Test) and `dry_run`
// is the config-level default for anything not yet flipped to Live.

// ── Module declarations ──────────────────────────────────────────────────────
mod adapter;
mod api;
mod app_state;
mod config;
mod notify;
mod reconciler;
mod risk;
mod scheduler;
mod signal;
mod slot;
mod store;
mod trader;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perpetual-engine starting up");

    let data_dir = std::env::var("ENGINE_DATA_DIR").unwrap_or_else(|_| ".".to_string());
    let config_path = PathBuf::from(&data_dir).join("engine_config.json");
    let db_path = PathBuf::from(&data_dir).join("state.db");

    let state = Arc::new(AppState::new(config_path, &db_path)?);
    info!(profiles = ?state.profile_ids(), "engine config loaded");

    let mut scheduler = Scheduler::new(state.clone());
    scheduler.start();

    let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let api_state = state.clone();
    let api_shutdown = state.shutdown.clone();
    let api_task = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind admin API, continuing without it");
                return;
            }
        };
        info!(addr = %bind_addr, "admin API listening");
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            api_shutdown.cancelled().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "admin API server failed");
        }
    });

    info!("all subsystems running, press ctrl+c or call /api/v1/shutdown to stop");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl_c");
            }
            warn!("shutdown signal received, stopping gracefully");
            state.shutdown.cancel();
        }
        _ = state.shutdown.cancelled() => {
            warn!("shutdown requested via admin API");
        }
    }

    scheduler.shutdown().await;
    let _ = api_task.await;

    if let Err(e) = state.save_config() {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("perpetual-engine shut down complete");
    Ok(())
}
