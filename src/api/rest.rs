// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `health` is public; every other route
// requires a valid Bearer token via the `AuthBearer` extractor. The surface is
// deliberately small: list positions, force-close one, resume a tripped
// circuit breaker, reload config from disk, and request shutdown. Nothing
// here computes trading decisions — it only observes and nudges the running
// engine.
//
// CORS is permissive; tighten `allowed_origins` for a production deployment.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{CancelHint, ExitReason, PositionStatus};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/force-close", post(force_close))
        .route("/api/v1/risk/resume", post(resume_after_circuit_breaker))
        .route("/api/v1/config/reload", post(reload_config))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    profiles: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        profiles: state.profile_ids().len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// List positions
// =============================================================================

#[derive(Deserialize)]
struct ListPositionsQuery {
    profile: Option<String>,
}

#[derive(Serialize)]
struct PositionView {
    id: i64,
    profile_id: String,
    pos_key: String,
    symbol: String,
    side: String,
    qty: Decimal,
    entry_price: Decimal,
    sl_price: Decimal,
    tp_price: Decimal,
    leverage: u32,
    status: String,
    timeframe: String,
}

impl From<crate::store::Position> for PositionView {
    fn from(p: crate::store::Position) -> Self {
        Self {
            id: p.id,
            profile_id: p.profile_id,
            pos_key: p.pos_key,
            symbol: p.symbol,
            side: p.side.to_string(),
            qty: p.qty,
            entry_price: p.entry_price,
            sl_price: p.sl_price,
            tp_price: p.tp_price,
            leverage: p.leverage,
            status: p.status.to_string(),
            timeframe: p.timeframe,
        }
    }
}

async fn list_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListPositionsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let positions = match q.profile {
        Some(profile_id) => state.store.list_active(&profile_id).await,
        None => state.store.list_all_active().await,
    };
    match positions {
        Ok(rows) => Ok(Json(rows.into_iter().map(PositionView::from).collect::<Vec<_>>())),
        Err(e) => {
            warn!(error = %e, "failed to list positions");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}

// =============================================================================
// Force-close a position
// =============================================================================

#[derive(Deserialize)]
struct ForceCloseRequest {
    pos_key: String,
}

#[derive(Serialize)]
struct ForceCloseResponse {
    pos_key: String,
    status: &'static str,
}

/// Cancels any live protective orders, closes the position at market, and
/// finalizes it with `ExitReason::Manual`. Exit price is recorded as the
/// entry price: the REST layer has no price oracle of its own (market data
/// is supplied externally, spec §6.1), so realized PnL for a manual close is
/// left to the trade journal's own reconciliation against venue fills.
async fn force_close(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForceCloseRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let all = state
        .store
        .list_all_active()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    let Some(pos) = all.into_iter().find(|p| p.pos_key == req.pos_key) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no open position with that pos_key" })),
        ));
    };

    let Some(runtime) = state.profile(&pos.profile_id) else {
        return Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "position's profile is not currently wired" })),
        ));
    };

    if matches!(pos.status, PositionStatus::Active) {
        for (order_id, hint) in [
            (pos.sl_order_id.as_deref(), CancelHint::Auto),
            (pos.tp_order_id.as_deref(), CancelHint::Auto),
        ] {
            if let Some(oid) = order_id {
                let _ = runtime.adapter.cancel_order(&pos.symbol, oid, hint).await;
            }
        }
        if let Err(e) = runtime
            .adapter
            .close_position_market(
                &pos.symbol,
                pos.side.opposite(),
                pos.qty,
                &format!("close_{}", pos.id),
            )
            .await
        {
            warn!(pos_key = %pos.pos_key, error = %e, "force-close market order failed");
        }
    }

    let trade = crate::store::Trade {
        pos_key: pos.pos_key.clone(),
        symbol: pos.symbol.clone(),
        side: pos.side,
        entry_price: pos.entry_price,
        exit_price: pos.entry_price,
        qty: pos.qty,
        pnl: Decimal::ZERO,
        fees: Decimal::ZERO,
        exit_reason: ExitReason::Manual,
        entry_time: pos.entry_time,
        exit_time: chrono::Utc::now().timestamp_millis(),
        feature_snapshot: pos.feature_snapshot.clone(),
    };
    state
        .store
        .finalize(pos.id, PositionStatus::Closed, Some(&trade))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    info!(pos_key = %pos.pos_key, "position force-closed via admin API");
    Ok(Json(ForceCloseResponse {
        pos_key: pos.pos_key,
        status: "closed",
    }))
}

// =============================================================================
// Resume trading after a tripped circuit breaker
// =============================================================================

#[derive(Deserialize)]
struct ProfileRequest {
    profile: String,
}

async fn resume_after_circuit_breaker(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProfileRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let Some(runtime) = state.profile(&req.profile) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown or inactive profile" })),
        ));
    };
    runtime.risk_gate.resume_after_circuit_breaker();
    info!(profile = %req.profile, "circuit breaker manually resumed via admin API");
    Ok(Json(serde_json::json!({ "profile": req.profile, "status": "resumed" })))
}

// =============================================================================
// Reload config from disk
// =============================================================================

async fn reload_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.reload_config().await;
    Json(serde_json::json!({ "status": "reloaded", "profiles": state.profile_ids() }))
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!("shutdown requested via admin API");
    state.shutdown.cancel();
    Json(serde_json::json!({ "status": "shutting down" }))
}
