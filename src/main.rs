//! solarb — CEX/DEX cross-venue arbitrage engine.
//!
//! Composition root: every component is built exactly once here and wired
//! through the typed event bus:
//!
//!   CEX WS ──cex.bookUpdate──┐
//!                            ├─→ SignalEngine ──signal.opportunity──→ ExecutionEngine
//!   DEX poll ──dex.poolUpdate┘                                              │
//!                                          trade.completed ←────────────────┘
//!                                          (risk service + windows + archive listen)

use tracing::{info, warn};

use solarb::arb::amm::{validate_layout, PoolLayout};
use solarb::arb::bus::EventBus;
use solarb::arb::cex::{CexConfig, CexConnector};
use solarb::arb::dex::{DexConfig, DexConnector};
use solarb::arb::executor::{ExecConfig, ExecutionEngine};
use solarb::arb::monitor::StatusMonitor;
use solarb::arb::risk::{RiskConfig, RiskService};
use solarb::arb::signal::{SignalConfig, SignalEngine, SymbolTable};
use solarb::gateway::{self, Archive, GatewayCtx};
use solarb::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  solarb — CEX/DEX Cross-Venue Arbitrage Engine");
    info!("═══════════════════════════════════════════════════");

    let settings = Settings::from_env()?;
    info!(
        "📊 config: assets={:?} observe_only={} threshold={}% max_pos=${} loss_limit=${}",
        settings.assets,
        settings.observe_only,
        settings.emit_threshold_pct,
        settings.max_position_size_usd,
        settings.daily_loss_limit_usd,
    );

    // The pool layout must reproduce the checked-in vector or we refuse to
    // start — a wrong byte offset silently prices every trade wrong.
    let layout = PoolLayout::from_env();
    validate_layout(&layout)?;
    info!("✅ pool layout {} v{} validated against check vector", layout.program, layout.version);

    if !settings.observe_only
        && (settings.cex.api_key.is_empty() || settings.cex.api_secret.is_empty())
    {
        anyhow::bail!(
            "🚨 FATAL: observe_only=false but no CEX credentials. \
             Set ARB_OBSERVE_ONLY=true or provide ARB_CEX_API_KEY / ARB_CEX_API_SECRET."
        );
    }
    if !settings.observe_only && settings.dex.swap_submit_url.is_none() {
        warn!("⚠️ live mode without ARB_DEX_SWAP_SUBMIT_URL — DEX legs will fail until configured");
    }

    // ═══ Build ═══

    let bus = EventBus::new();

    let risk = RiskService::new(RiskConfig::from_settings(&settings), bus.clone());
    risk.attach().await;

    let cex_symbols: Vec<String> = settings
        .assets
        .iter()
        .filter_map(|a| settings.venue_symbol(a).map(|s| s.to_string()))
        .collect();
    let cex = CexConnector::new(
        CexConfig {
            venue: settings.cex.venue.clone(),
            ws_public_url: settings.cex.ws_public_url.clone(),
            base_url: settings.cex.base_url.clone(),
            api_key: settings.cex.api_key.clone(),
            api_secret: settings.cex.api_secret.clone(),
            symbols: cex_symbols.clone(),
        },
        bus.clone(),
    );

    let dex = DexConnector::new(DexConfig::from_settings(&settings), layout, bus.clone());

    let signal = SignalEngine::new(
        SignalConfig::from_settings(&settings),
        SymbolTable::from_settings(&settings),
        bus.clone(),
    );
    signal.attach().await;

    let executor = ExecutionEngine::new(
        ExecConfig::from_settings(&settings),
        bus.clone(),
        risk.clone(),
        cex.clone(),
        dex.clone(),
        settings.symbol_map.clone(),
        settings.pool_addresses.clone(),
    );
    executor.attach().await;

    let archive = Archive::new();
    archive.attach(&bus).await;

    // ═══ Spawn ═══

    let mut handles = Vec::new();
    handles.push(tokio::spawn(cex.clone().run()));
    handles.push(tokio::spawn(dex.clone().run()));

    let monitor = StatusMonitor::new(
        risk.clone(),
        cex.clone(),
        dex.clone(),
        signal.clone(),
        settings.cex.venue.clone(),
        cex_symbols,
        settings.pool_addresses.values().cloned().collect(),
    );
    handles.push(tokio::spawn(monitor.run()));

    let ctx = GatewayCtx {
        bus: bus.clone(),
        risk: risk.clone(),
        cex: cex.clone(),
        signal: signal.clone(),
        archive: archive.clone(),
    };
    let gateway_addr = settings.gateway_addr;
    handles.push(tokio::spawn(async move {
        if let Err(e) = gateway::serve(ctx, gateway_addr).await {
            warn!("🌐 gateway exited: {:?}", e);
        }
    }));

    info!("🚀 all tasks spawned — running until ctrl-c");
    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown requested — cancelling tasks");
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }
    info!("👋 shutdown complete");
    Ok(())
}
