//! Thin operator gateway — axum surface over the running system.
//!
//! Read side: risk status, connector state, bus counters, and bounded
//! in-memory listings of recent trades, opportunities, and windows (the
//! archive subscribes to the same bus events everyone else sees; a durable
//! document store would subscribe the same way). Write side: the risk
//! operations pause / resume / observe-only.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::arb::bus::{BusEvent, EventBus, Topic};
use crate::arb::cex::CexConnector;
use crate::arb::risk::RiskService;
use crate::arb::signal::SignalEngine;
use crate::arb::types::{Opportunity, Trade, Window};

// ─────────────────────────────────────────────────────────
// Archive
// ─────────────────────────────────────────────────────────

const ARCHIVE_CAPACITY: usize = 1_000;

/// Bounded ring buffers of recent events, newest first on read.
pub struct Archive {
    trades: Mutex<VecDeque<Trade>>,
    opportunities: Mutex<VecDeque<Opportunity>>,
}

impl Archive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            trades: Mutex::new(VecDeque::with_capacity(ARCHIVE_CAPACITY)),
            opportunities: Mutex::new(VecDeque::with_capacity(ARCHIVE_CAPACITY)),
        })
    }

    /// Subscribe the archive to the bus. Opportunities are recorded even
    /// while risk is paused — observable history, never actionable.
    pub async fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let archive = self.clone();
        bus.subscribe(
            Topic::TradeCompleted,
            "archive",
            Arc::new(move |ev| {
                let archive = archive.clone();
                Box::pin(async move {
                    if let BusEvent::TradeCompleted(trade) = ev {
                        let mut trades = archive.trades.lock().await;
                        if trades.len() >= ARCHIVE_CAPACITY {
                            trades.pop_front();
                        }
                        trades.push_back(trade);
                    }
                    Ok(())
                })
            }),
        )
        .await;

        let archive = self.clone();
        bus.subscribe(
            Topic::Opportunity,
            "archive",
            Arc::new(move |ev| {
                let archive = archive.clone();
                Box::pin(async move {
                    if let BusEvent::Opportunity(opp) = ev {
                        let mut opps = archive.opportunities.lock().await;
                        if opps.len() >= ARCHIVE_CAPACITY {
                            opps.pop_front();
                        }
                        opps.push_back(opp);
                    }
                    Ok(())
                })
            }),
        )
        .await;
    }

    pub async fn recent_trades(&self) -> Vec<Trade> {
        self.trades.lock().await.iter().rev().cloned().collect()
    }

    pub async fn recent_opportunities(&self) -> Vec<Opportunity> {
        self.opportunities.lock().await.iter().rev().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GatewayCtx {
    pub bus: Arc<EventBus>,
    pub risk: Arc<RiskService>,
    pub cex: Arc<CexConnector>,
    pub signal: Arc<SignalEngine>,
    pub archive: Arc<Archive>,
}

#[derive(Debug, Deserialize)]
struct PauseBody {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ObserveOnlyBody {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct WindowsBody {
    open: Vec<Window>,
    closed: Vec<Window>,
}

pub fn router(ctx: GatewayCtx) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/risk/pause", post(post_pause))
        .route("/risk/resume", post(post_resume))
        .route("/risk/observe-only", post(post_observe_only))
        .route("/trades", get(get_trades))
        .route("/opportunities", get(get_opportunities))
        .route("/windows", get(get_windows))
        .with_state(ctx)
}

pub async fn serve(ctx: GatewayCtx, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 gateway listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_status(State(ctx): State<GatewayCtx>) -> Json<Value> {
    let risk = ctx.risk.get_status().await;
    Json(json!({
        "risk": risk,
        "cex_state": ctx.cex.state().await,
        "cex_dropped_frames": ctx.cex.dropped_frames(),
        "cex_auth_halted": ctx.cex.is_auth_halted(),
        "bus": ctx.bus.stats().await,
    }))
}

async fn post_pause(State(ctx): State<GatewayCtx>, Json(body): Json<PauseBody>) -> Json<Value> {
    warn!("🌐 operator pause: {}", body.reason);
    ctx.risk.trigger_pause(&body.reason).await;
    Json(json!({ "ok": true }))
}

async fn post_resume(State(ctx): State<GatewayCtx>) -> Json<Value> {
    info!("🌐 operator resume");
    ctx.risk.resume().await;
    Json(json!({ "ok": true }))
}

async fn post_observe_only(
    State(ctx): State<GatewayCtx>,
    Json(body): Json<ObserveOnlyBody>,
) -> Json<Value> {
    ctx.risk.set_observe_only(body.enabled).await;
    Json(json!({ "ok": true, "observe_only": body.enabled }))
}

async fn get_trades(State(ctx): State<GatewayCtx>) -> Json<Vec<Trade>> {
    Json(ctx.archive.recent_trades().await)
}

async fn get_opportunities(State(ctx): State<GatewayCtx>) -> Json<Vec<Opportunity>> {
    Json(ctx.archive.recent_opportunities().await)
}

async fn get_windows(State(ctx): State<GatewayCtx>) -> Json<WindowsBody> {
    Json(WindowsBody {
        open: ctx.signal.open_windows().await,
        closed: ctx.signal.closed_windows().await,
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
