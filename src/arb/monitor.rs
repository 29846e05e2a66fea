//! Status monitor — the 5 s heartbeat of the process.
//!
//! Feeds venue freshness into the risk staleness gate, sweeps idle trading
//! windows shut, and logs a one-line posture summary.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::cex::CexConnector;
use super::dex::DexConnector;
use super::risk::RiskService;
use super::signal::SignalEngine;

const MONITOR_PERIOD_SEC: u64 = 5;

pub struct StatusMonitor {
    risk: Arc<RiskService>,
    cex: Arc<CexConnector>,
    dex: Arc<DexConnector>,
    signal: Arc<SignalEngine>,
    cex_venue: String,
    cex_symbols: Vec<String>,
    pool_addresses: Vec<String>,
}

impl StatusMonitor {
    pub fn new(
        risk: Arc<RiskService>,
        cex: Arc<CexConnector>,
        dex: Arc<DexConnector>,
        signal: Arc<SignalEngine>,
        cex_venue: String,
        cex_symbols: Vec<String>,
        pool_addresses: Vec<String>,
    ) -> Self {
        Self {
            risk,
            cex,
            dex,
            signal,
            cex_venue,
            cex_symbols,
            pool_addresses,
        }
    }

    pub async fn run(self) {
        info!("🩺 status monitor started ({}s period)", MONITOR_PERIOD_SEC);
        let mut ticker = tokio::time::interval(Duration::from_secs(MONITOR_PERIOD_SEC));
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        // Feeds that have produced data are held to the staleness contract.
        // A feed that never connected has nothing to check yet.
        for symbol in &self.cex_symbols {
            if let Some(ts) = self.cex.last_update_ts(symbol).await {
                self.risk.check_staleness(&self.cex_venue, ts).await;
            }
        }
        for pool in &self.pool_addresses {
            if let Some(ts) = self.dex.last_update_ts(pool).await {
                self.risk.check_staleness("solana", ts).await;
            }
        }

        self.signal.close_idle_windows().await;

        let status = self.risk.get_status().await;
        info!(
            "🩺 cex={:?} dropped={} paused={} daily_pnl={} trades={} observe_only={}",
            self.cex.state().await,
            self.cex.dropped_frames(),
            status.is_paused,
            status.daily_pnl_usd,
            status.daily_trades,
            status.observe_only,
        );
    }
}
