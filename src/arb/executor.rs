//! Execution engine — turns opportunities into two-leg trades.
//!
//! Per opportunity: gate on the risk kill-switch and detection age, size
//! against the position limit, run both legs sequentially (inbound leg
//! first), account realized PnL, publish `trade.completed`.
//!
//! The legs are NOT atomic. One filled leg plus one failed leg is published
//! as `partially_filled` — the imbalance is the operator's to unwind, never
//! auto-hedged here. Concurrency is capped by a semaphore so a burst of
//! signals cannot stack unbounded venue exposure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{BusEvent, EventBus, Topic};
use super::cex::CexConnector;
use super::dex::DexConnector;
use super::risk::RiskService;
use super::types::{Direction, Opportunity, OrderStatus, Side, Trade};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub max_position_size_usd: Decimal,
    pub cex_fee_pct: Decimal,
    pub dex_fee_pct: Decimal,
    /// Chain priority fee modeled as a percentage in the cost stack.
    pub priority_fee_pct: Decimal,
    pub priority_fee_lamports: u64,
    /// Concurrent trade executions allowed in flight.
    pub max_inflight: usize,
    /// Opportunities older than this are dropped at the gate.
    pub max_opportunity_age_sec: i64,
    /// IOC limit price cushion around the expected price.
    pub cex_price_cushion_pct: Decimal,
    /// min_size_out = expected_out · (1 − this/100).
    pub dex_min_out_haircut_pct: Decimal,
    /// Impact cap handed to the bound quote on the DEX leg.
    pub dex_slippage_bps: u32,
}

impl ExecConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self {
            max_position_size_usd: settings.max_position_size_usd,
            cex_fee_pct: settings.cex_fee_pct,
            dex_fee_pct: settings.dex_fee_pct,
            priority_fee_pct: dec!(0.05),
            priority_fee_lamports: settings.priority_fee_lamports,
            max_inflight: 4,
            max_opportunity_age_sec: 30,
            cex_price_cushion_pct: dec!(0.1),
            dex_min_out_haircut_pct: dec!(1.0),
            dex_slippage_bps: 100,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Leg outcome
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct LegOutcome {
    cex_price: Decimal,
    dex_price: Decimal,
    cex_order_id: Option<String>,
    dex_tx_sig: Option<String>,
    status: OrderStatus,
    /// Simulated executions carry their own latency.
    latency_ms: Option<u64>,
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    cfg: ExecConfig,
    bus: Arc<EventBus>,
    risk: Arc<RiskService>,
    cex: Arc<CexConnector>,
    dex: Arc<DexConnector>,
    /// canonical asset → CEX venue symbol.
    venue_symbols: HashMap<String, String>,
    /// canonical asset → pool address.
    pools: HashMap<String, String>,
    inflight: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(
        cfg: ExecConfig,
        bus: Arc<EventBus>,
        risk: Arc<RiskService>,
        cex: Arc<CexConnector>,
        dex: Arc<DexConnector>,
        venue_symbols: HashMap<String, String>,
        pools: HashMap<String, String>,
    ) -> Arc<Self> {
        let inflight = Arc::new(Semaphore::new(cfg.max_inflight));
        Arc::new(Self {
            cfg,
            bus,
            risk,
            cex,
            dex,
            venue_symbols,
            pools,
            inflight,
        })
    }

    /// Wire the opportunity handler onto the bus. Executions run as their
    /// own tasks so a slow venue never back-pressures market data.
    pub async fn attach(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus
            .subscribe(
                Topic::Opportunity,
                "execution-engine",
                Arc::new(move |ev| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let BusEvent::Opportunity(opp) = ev {
                            tokio::spawn(engine.handle_opportunity(opp));
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    pub async fn handle_opportunity(self: Arc<Self>, opp: Opportunity) {
        // Gate: consult risk after detection, before any external order.
        if self.risk.is_paused().await {
            debug!("🛑 stale_opportunity {}: risk paused", opp.id);
            return;
        }
        let age = Utc::now() - opp.detected_at;
        if age > Duration::seconds(self.cfg.max_opportunity_age_sec) {
            debug!("🛑 stale_opportunity {}: {}s old", opp.id, age.num_seconds());
            return;
        }

        let Ok(_permit) = self.inflight.clone().acquire_owned().await else {
            return; // Semaphore closed — shutting down.
        };

        let trade_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        // Plan: cap the intended size against the position limit.
        let size = if opp.cex_price > Decimal::ZERO {
            opp.size.min(self.cfg.max_position_size_usd / opp.cex_price)
        } else {
            opp.size
        };

        let outcome = if self.risk.observe_only().await {
            self.simulate_legs(&opp).await
        } else {
            self.execute_legs(&trade_id, &opp, size).await
        };

        let latency_ms = outcome
            .latency_ms
            .unwrap_or(started.elapsed().as_millis() as u64);
        let trade = self.account(trade_id, &opp, size, outcome, latency_ms);

        info!(
            "🏁 trade {}… {} {} size={} pnl={:.4}% (${:.2}) latency={}ms status={:?}",
            &trade.trade_id[..8.min(trade.trade_id.len())],
            trade.asset,
            trade.direction.as_str(),
            trade.size,
            trade.pnl_pct,
            trade.pnl_abs,
            trade.latency_ms,
            trade.status,
        );
        self.bus.publish(BusEvent::TradeCompleted(trade)).await;
    }

    // ─────────────────────────────────────────────────
    // Observe-only execution
    // ─────────────────────────────────────────────────

    /// Fully local synthesis: both legs fill with a realistic slippage in
    /// [0.05%, 0.15%] and a latency in [200ms, 500ms]. No external calls.
    async fn simulate_legs(&self, opp: &Opportunity) -> LegOutcome {
        let (latency_ms, slippage) = {
            let mut rng = rand::thread_rng();
            (
                rand::Rng::gen_range(&mut rng, 200..=500u64),
                rand::Rng::gen_range(&mut rng, 0.0005..0.0015f64),
            )
        };
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;

        let slip = Decimal::from_f64(slippage).unwrap_or(dec!(0.001));
        let (cex_price, dex_price) = match opp.direction {
            // Buy CEX (pay slightly more), sell DEX (receive slightly less).
            Direction::CexToDex => (
                opp.cex_price * (Decimal::ONE + slip),
                opp.dex_price * (Decimal::ONE - slip),
            ),
            // Buy DEX (pay slightly more), sell CEX (receive slightly less).
            Direction::DexToCex => (
                opp.cex_price * (Decimal::ONE - slip),
                opp.dex_price * (Decimal::ONE + slip),
            ),
        };

        let suffix = &opp.id[..8.min(opp.id.len())];
        LegOutcome {
            cex_price,
            dex_price,
            cex_order_id: Some(format!("sim_cex_{suffix}")),
            dex_tx_sig: Some(format!("sim_dex_{suffix}")),
            status: OrderStatus::Filled,
            latency_ms: Some(latency_ms),
        }
    }

    // ─────────────────────────────────────────────────
    // Live execution
    // ─────────────────────────────────────────────────

    /// Sequential dual-leg execution, inbound leg first. A failed first leg
    /// aborts the second (`failed`); a failed second leg after a filled
    /// first is `partially_filled` and the imbalance stays visible.
    async fn execute_legs(&self, trade_id: &str, opp: &Opportunity, size: Decimal) -> LegOutcome {
        let mut outcome = LegOutcome {
            cex_price: opp.cex_price,
            dex_price: opp.dex_price,
            cex_order_id: None,
            dex_tx_sig: None,
            status: OrderStatus::Pending,
            latency_ms: None,
        };

        let (Some(symbol), Some(pool)) = (
            self.venue_symbols.get(&opp.asset),
            self.pools.get(&opp.asset),
        ) else {
            warn!("❌ no venue mapping for {} — dropping {}", opp.asset, opp.id);
            outcome.status = OrderStatus::Failed;
            return outcome;
        };

        let cushion = self.cfg.cex_price_cushion_pct / dec!(100);
        let min_out_factor = Decimal::ONE - self.cfg.dex_min_out_haircut_pct / dec!(100);
        let client_order_id = format!("{trade_id}-cex");

        match opp.direction {
            Direction::CexToDex => {
                // Leg 1: buy on the CEX at a slight premium.
                let cex_result = self
                    .cex
                    .place_ioc_order(
                        symbol,
                        Side::Buy,
                        size,
                        opp.cex_price * (Decimal::ONE + cushion),
                        &client_order_id,
                    )
                    .await;
                match cex_result {
                    Ok(ack) => {
                        outcome.cex_order_id =
                            ack.venue_order_id.or(Some(ack.client_order_id));
                    }
                    Err(e) => {
                        warn!("❌ CEX leg failed for {}: {:?}", opp.id, e);
                        outcome.status = OrderStatus::Failed;
                        return outcome;
                    }
                }

                // Leg 2: sell the base into the pool. Prefer the connector's
                // bound quote for expected_out; fall back to the detection
                // price if the pool refuses to quote.
                let expected_out = match self
                    .dex
                    .bound_quote(pool, Side::Sell, size, self.cfg.dex_slippage_bps)
                    .await
                {
                    Some(quote) => quote.size_out,
                    None => size * opp.dex_price,
                };
                let min_out = expected_out * min_out_factor;
                match self
                    .dex
                    .execute_swap(pool, Side::Sell, size, min_out, self.cfg.priority_fee_lamports)
                    .await
                {
                    Ok(sig) => {
                        outcome.dex_tx_sig = Some(sig);
                        outcome.status = OrderStatus::Filled;
                    }
                    Err(e) => {
                        warn!("⚠️ DEX leg failed after CEX fill for {}: {:?}", opp.id, e);
                        outcome.status = OrderStatus::PartiallyFilled;
                    }
                }
            }
            Direction::DexToCex => {
                // Leg 1: buy the base from the pool, paying quote units.
                let expected_out = match self
                    .dex
                    .bound_quote(pool, Side::Buy, size * opp.dex_price, self.cfg.dex_slippage_bps)
                    .await
                {
                    Some(quote) => quote.size_out,
                    None => size,
                };
                let min_out = expected_out * min_out_factor;
                match self
                    .dex
                    .execute_swap(
                        pool,
                        Side::Buy,
                        size * opp.dex_price,
                        min_out,
                        self.cfg.priority_fee_lamports,
                    )
                    .await
                {
                    Ok(sig) => outcome.dex_tx_sig = Some(sig),
                    Err(e) => {
                        warn!("❌ DEX leg failed for {}: {:?}", opp.id, e);
                        outcome.status = OrderStatus::Failed;
                        return outcome;
                    }
                }

                // Leg 2: sell on the CEX at a slight discount.
                let cex_result = self
                    .cex
                    .place_ioc_order(
                        symbol,
                        Side::Sell,
                        size,
                        opp.cex_price * (Decimal::ONE - cushion),
                        &client_order_id,
                    )
                    .await;
                match cex_result {
                    Ok(ack) => {
                        outcome.cex_order_id =
                            ack.venue_order_id.or(Some(ack.client_order_id));
                        outcome.status = OrderStatus::Filled;
                    }
                    Err(e) => {
                        warn!("⚠️ CEX leg failed after DEX fill for {}: {:?}", opp.id, e);
                        outcome.status = OrderStatus::PartiallyFilled;
                    }
                }
            }
        }
        outcome
    }

    // ─────────────────────────────────────────────────
    // Accounting
    // ─────────────────────────────────────────────────

    /// fees_total = size · mean(cex, dex) · (cex_fee + dex_fee + priority) / 100
    /// pnl_abs    = |cex − dex| · size − fees_total
    /// pnl_pct    = pnl_abs / (size · cex_price) · 100
    fn account(
        &self,
        trade_id: String,
        opp: &Opportunity,
        size: Decimal,
        outcome: LegOutcome,
        latency_ms: u64,
    ) -> Trade {
        let mean_price = (outcome.cex_price + outcome.dex_price) / dec!(2);
        let fee_pct_total =
            self.cfg.cex_fee_pct + self.cfg.dex_fee_pct + self.cfg.priority_fee_pct;
        let fees_total = size * mean_price * fee_pct_total / dec!(100);
        let pnl_abs = (outcome.cex_price - outcome.dex_price).abs() * size - fees_total;
        let notional = size * outcome.cex_price;
        let pnl_pct = if notional > Decimal::ZERO {
            pnl_abs / notional * dec!(100)
        } else {
            Decimal::ZERO
        };

        Trade {
            trade_id,
            opportunity_id: opp.id.clone(),
            asset: opp.asset.clone(),
            direction: opp.direction,
            size,
            cex_price: outcome.cex_price,
            dex_price: outcome.dex_price,
            fees_total,
            pnl_abs,
            pnl_pct,
            latency_ms,
            status: outcome.status,
            cex_order_id: outcome.cex_order_id,
            dex_tx_sig: outcome.dex_tx_sig,
            completed_at: Utc::now(),
            window_id: opp.window_id.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arb::amm::PoolLayout;
    use crate::arb::cex::CexConfig;
    use crate::arb::dex::DexConfig;
    use crate::arb::risk::{RiskConfig, RiskService};
    use crate::Settings;
    use tokio::sync::Mutex;

    fn build_engine(observe_only: bool) -> (Arc<EventBus>, Arc<RiskService>, Arc<ExecutionEngine>) {
        let settings = Settings::default();
        let bus = EventBus::new();

        let risk = RiskService::new(
            RiskConfig {
                daily_loss_limit_usd: settings.daily_loss_limit_usd,
                staleness_threshold_sec: 10,
                pause_debounce_sec: 60,
                observe_only,
            },
            bus.clone(),
        );
        let cex = CexConnector::new(
            CexConfig {
                venue: "gemini".to_string(),
                ws_public_url: String::new(),
                base_url: String::new(),
                api_key: String::new(),
                api_secret: String::new(),
                symbols: vec!["solusd".to_string()],
            },
            bus.clone(),
        );
        let dex = DexConnector::new(
            DexConfig::from_settings(&settings),
            PoolLayout::whirlpool_sol_usdc(),
            bus.clone(),
        );
        let engine = ExecutionEngine::new(
            ExecConfig::from_settings(&settings),
            bus.clone(),
            risk.clone(),
            cex,
            dex,
            settings.symbol_map.clone(),
            settings.pool_addresses.clone(),
        );
        (bus, risk, engine)
    }

    fn opportunity(direction: Direction) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4().to_string(),
            asset: "SOL-USD".to_string(),
            direction,
            cex_price: dec!(143.00),
            dex_price: dec!(145.50),
            spread_pct: dec!(1.7483),
            predicted_pnl_pct: dec!(0.3483),
            size: dec!(50),
            detected_at: Utc::now(),
            window_id: Uuid::new_v4().to_string(),
        }
    }

    async fn trade_sink(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<Trade>>> {
        let captured: Arc<Mutex<Vec<Trade>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        bus.subscribe(
            Topic::TradeCompleted,
            "test-sink",
            Arc::new(move |ev| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let BusEvent::TradeCompleted(trade) = ev {
                        sink.lock().await.push(trade);
                    }
                    Ok(())
                })
            }),
        )
        .await;
        captured
    }

    #[tokio::test]
    async fn test_observe_only_trade_is_realistic() {
        let (bus, _risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        let opp = opportunity(Direction::CexToDex);

        engine.clone().handle_opportunity(opp.clone()).await;

        let trades = sink.lock().await;
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.status, OrderStatus::Filled);
        assert!(trade.latency_ms >= 200 && trade.latency_ms <= 500);

        // Realized slippage per leg sits in [0.05%, 0.15%].
        let cex_slip = (trade.cex_price - opp.cex_price).abs() / opp.cex_price;
        let dex_slip = (trade.dex_price - opp.dex_price).abs() / opp.dex_price;
        assert!(cex_slip >= dec!(0.0005) && cex_slip <= dec!(0.0015));
        assert!(dex_slip >= dec!(0.0005) && dex_slip <= dec!(0.0015));

        assert!(trade.cex_order_id.as_deref().unwrap().starts_with("sim_cex_"));
        assert!(trade.dex_tx_sig.as_deref().unwrap().starts_with("sim_dex_"));
    }

    #[tokio::test]
    async fn test_pnl_identity_holds() {
        let (bus, _risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        engine.clone().handle_opportunity(opportunity(Direction::DexToCex)).await;

        let trades = sink.lock().await;
        let t = &trades[0];
        let expected = (t.cex_price - t.dex_price).abs() * t.size - t.fees_total;
        let tolerance = expected.abs().max(dec!(1)) * dec!(0.000001);
        assert!((t.pnl_abs - expected).abs() <= tolerance);

        let expected_pct = t.pnl_abs / (t.size * t.cex_price) * dec!(100);
        assert!((t.pnl_pct - expected_pct).abs() <= dec!(0.000001));
    }

    #[tokio::test]
    async fn test_size_capped_by_position_limit() {
        let (bus, _risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        engine.clone().handle_opportunity(opportunity(Direction::CexToDex)).await;

        let trades = sink.lock().await;
        // max_position 1000 USD at 143.00 → ~6.993 base units, well under 50.
        assert_eq!(trades[0].size, dec!(1000) / dec!(143.00));
    }

    #[tokio::test]
    async fn test_paused_risk_blocks_execution() {
        let (bus, risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        risk.trigger_pause("test").await;

        engine.clone().handle_opportunity(opportunity(Direction::CexToDex)).await;
        assert!(sink.lock().await.is_empty());
        assert_eq!(bus.stats().await.get("trade.completed"), None);
    }

    #[tokio::test]
    async fn test_stale_venue_gates_execution_end_to_end() {
        // A stale feed latches the kill-switch; a fresh opportunity after
        // that must not produce any completed trade.
        let (bus, risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        risk.check_staleness("gemini", Utc::now() - Duration::seconds(15)).await;
        assert!(risk.is_paused().await);

        engine.clone().handle_opportunity(opportunity(Direction::CexToDex)).await;
        assert!(sink.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_aged_opportunity_dropped() {
        let (bus, _risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        let mut opp = opportunity(Direction::CexToDex);
        opp.detected_at = Utc::now() - Duration::seconds(31);

        engine.clone().handle_opportunity(opp).await;
        assert!(sink.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_live_first_leg_failure_is_failed_trade() {
        // Live mode with no CEX credentials: the inbound leg errs, the
        // second leg is never attempted, and the failure is published.
        let (bus, _risk, engine) = build_engine(false);
        let sink = trade_sink(&bus).await;
        engine.clone().handle_opportunity(opportunity(Direction::CexToDex)).await;

        let trades = sink.lock().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, OrderStatus::Failed);
        assert!(trades[0].cex_order_id.is_none());
        assert!(trades[0].dex_tx_sig.is_none());
    }

    #[tokio::test]
    async fn test_trade_ids_are_unique() {
        let (bus, _risk, engine) = build_engine(true);
        let sink = trade_sink(&bus).await;
        engine.clone().handle_opportunity(opportunity(Direction::CexToDex)).await;
        engine.clone().handle_opportunity(opportunity(Direction::DexToCex)).await;

        let trades = sink.lock().await;
        assert_eq!(trades.len(), 2);
        assert_ne!(trades[0].trade_id, trades[1].trade_id);
    }
}
