//! Signal engine — cross-venue profitability predicate and trading windows.
//!
//! Holds the latest book/pool snapshot per canonical asset label and
//! re-evaluates both arbitrage directions on every market-data event:
//!
//!   cex→dex: gross = (dex_mid − cex_ask) / cex_ask · 100
//!   dex→cex: gross = (cex_bid − dex_mid) / dex_mid · 100
//!
//! net = gross − (cex_fee + dex_fee + haircut); an opportunity is emitted
//! when net clears the configured threshold. Emission continues while risk
//! is paused — opportunities stay observable, the execution gate makes them
//! non-actionable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::bus::{BusEvent, EventBus, Topic};
use super::types::{BookSnapshot, Direction, Opportunity, PoolSnapshot, Trade, Window};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub cex_fee_pct: Decimal,
    pub dex_fee_pct: Decimal,
    pub haircut_pct: Decimal,
    pub emit_threshold_pct: Decimal,
    pub window_grace_sec: u64,
    /// Intended size in base units; the execution engine caps it against
    /// the position limit.
    pub default_size: Decimal,
}

impl SignalConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self {
            cex_fee_pct: settings.cex_fee_pct,
            dex_fee_pct: settings.dex_fee_pct,
            haircut_pct: settings.haircut_pct,
            emit_threshold_pct: settings.emit_threshold_pct,
            window_grace_sec: settings.window_grace_sec,
            default_size: dec!(50),
        }
    }

    fn total_cost_pct(&self) -> Decimal {
        self.cex_fee_pct + self.dex_fee_pct + self.haircut_pct
    }
}

// ─────────────────────────────────────────────────────────
// Asset-label normalization
// ─────────────────────────────────────────────────────────

/// The configured mapping table is the single source of truth for pairing
/// venue feeds: venue symbols and pool addresses both resolve to one
/// canonical asset label.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    venue_to_canonical: HashMap<String, String>,
    pool_to_asset: HashMap<String, String>,
}

impl SymbolTable {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        let mut venue_to_canonical = HashMap::new();
        for (canonical, venue_symbol) in &settings.symbol_map {
            venue_to_canonical.insert(venue_symbol.to_lowercase(), canonical.clone());
        }
        let mut pool_to_asset = HashMap::new();
        for (asset, pool) in &settings.pool_addresses {
            pool_to_asset.insert(pool.clone(), asset.clone());
        }
        Self { venue_to_canonical, pool_to_asset }
    }

    pub fn canonical_for_symbol(&self, venue_symbol: &str) -> Option<&str> {
        self.venue_to_canonical
            .get(&venue_symbol.to_lowercase())
            .map(|s| s.as_str())
    }

    pub fn asset_for_pool(&self, pool: &str) -> Option<&str> {
        self.pool_to_asset.get(pool).map(|s| s.as_str())
    }
}

// ─────────────────────────────────────────────────────────
// Window manager
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct WindowSlot {
    window: Window,
    last_signal: DateTime<Utc>,
    dir_counts: HashMap<Direction, u64>,
    pnl_sum: Decimal,
}

/// Per asset, one open window while activity is recent. Idleness is
/// measured from the last signal; a window idle longer than 2× grace is
/// closed (end_ts = close time) and archived, and the next signal opens a
/// fresh one.
#[derive(Debug)]
pub struct WindowManager {
    grace: Duration,
    open: HashMap<String, WindowSlot>,
    closed: Vec<Window>,
}

impl WindowManager {
    pub fn new(grace_sec: u64) -> Self {
        Self {
            grace: Duration::seconds(grace_sec as i64),
            open: HashMap::new(),
            closed: Vec::new(),
        }
    }

    fn idle_cutoff(&self) -> Duration {
        self.grace * 2
    }

    /// Record a signal for an asset, rolling the window if it went idle.
    /// Returns the id of the window the signal belongs to.
    pub fn observe_signal(
        &mut self,
        asset: &str,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> String {
        let rolled = self
            .open
            .get(asset)
            .map(|slot| now - slot.last_signal > self.idle_cutoff())
            .unwrap_or(false);
        if rolled {
            if let Some(mut slot) = self.open.remove(asset) {
                slot.window.end_ts = Some(now);
                debug!(
                    "🪟 window {} closed for {} ({} signals, {} trades)",
                    slot.window.id, asset, slot.window.signals, slot.window.trades,
                );
                self.closed.push(slot.window);
            }
        }

        let slot = self.open.entry(asset.to_string()).or_insert_with(|| WindowSlot {
            window: Window {
                id: Uuid::new_v4().to_string(),
                asset: asset.to_string(),
                start_ts: now,
                end_ts: None,
                signals: 0,
                trades: 0,
                dominant_dir: None,
                max_net_pnl_pct: Decimal::ZERO,
                mean_net_pnl_pct: Decimal::ZERO,
            },
            last_signal: now,
            dir_counts: HashMap::new(),
            pnl_sum: Decimal::ZERO,
        });

        slot.window.signals += 1;
        slot.last_signal = now;
        *slot.dir_counts.entry(direction).or_insert(0) += 1;
        slot.window.dominant_dir = slot
            .dir_counts
            .iter()
            .max_by_key(|(_, n)| **n)
            .map(|(d, _)| *d);

        slot.window.id.clone()
    }

    /// Fold a completed trade's realized PnL into its window statistics.
    pub fn observe_trade(&mut self, window_id: &str, pnl_pct: Decimal) {
        let Some(slot) = self.open.values_mut().find(|s| s.window.id == window_id) else {
            return; // Window already archived — historical trade, nothing to fold.
        };
        slot.window.trades += 1;
        slot.pnl_sum += pnl_pct;
        if pnl_pct > slot.window.max_net_pnl_pct || slot.window.trades == 1 {
            slot.window.max_net_pnl_pct = pnl_pct;
        }
        slot.window.mean_net_pnl_pct = slot.pnl_sum / Decimal::from(slot.window.trades);
    }

    /// Close every window that has gone idle. Called periodically so
    /// windows also close without a follow-up signal.
    pub fn close_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = self.idle_cutoff();
        let idle_assets: Vec<String> = self
            .open
            .iter()
            .filter(|(_, slot)| now - slot.last_signal > cutoff)
            .map(|(asset, _)| asset.clone())
            .collect();
        for asset in idle_assets {
            if let Some(mut slot) = self.open.remove(&asset) {
                slot.window.end_ts = Some(now);
                info!(
                    "🪟 window {} closed for {} ({} signals, {} trades)",
                    slot.window.id, asset, slot.window.signals, slot.window.trades,
                );
                self.closed.push(slot.window);
            }
        }
    }

    pub fn open_windows(&self) -> Vec<Window> {
        self.open.values().map(|s| s.window.clone()).collect()
    }

    pub fn closed_windows(&self) -> Vec<Window> {
        self.closed.clone()
    }
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct EngineState {
    cex_books: HashMap<String, BookSnapshot>,
    dex_pools: HashMap<String, PoolSnapshot>,
    windows: WindowManager,
}

pub struct SignalEngine {
    cfg: SignalConfig,
    symbols: SymbolTable,
    bus: Arc<EventBus>,
    state: Mutex<EngineState>,
}

impl SignalEngine {
    pub fn new(cfg: SignalConfig, symbols: SymbolTable, bus: Arc<EventBus>) -> Arc<Self> {
        let windows = WindowManager::new(cfg.window_grace_sec);
        Arc::new(Self {
            cfg,
            symbols,
            bus,
            state: Mutex::new(EngineState {
                cex_books: HashMap::new(),
                dex_pools: HashMap::new(),
                windows,
            }),
        })
    }

    /// Wire market-data and trade handlers onto the bus.
    pub async fn attach(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus
            .subscribe(
                Topic::CexBook,
                "signal-engine",
                Arc::new(move |ev| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let BusEvent::CexBook(book) = ev {
                            engine.on_cex_book(book).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let engine = self.clone();
        self.bus
            .subscribe(
                Topic::DexPool,
                "signal-engine",
                Arc::new(move |ev| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let BusEvent::DexPool(pool) = ev {
                            engine.on_dex_pool(pool).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let engine = self.clone();
        self.bus
            .subscribe(
                Topic::TradeCompleted,
                "signal-engine",
                Arc::new(move |ev| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let BusEvent::TradeCompleted(trade) = ev {
                            engine.on_trade_completed(&trade).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    pub async fn on_cex_book(&self, book: BookSnapshot) {
        let Some(asset) = self.symbols.canonical_for_symbol(&book.symbol) else {
            debug!("❔ book for unmapped symbol {}", book.symbol);
            return;
        };
        let asset = asset.to_string();
        {
            let mut state = self.state.lock().await;
            state.cex_books.insert(asset.clone(), book);
        }
        self.check(&asset).await;
    }

    pub async fn on_dex_pool(&self, pool: PoolSnapshot) {
        let Some(asset) = self.symbols.asset_for_pool(&pool.pool) else {
            debug!("❔ pool update for unmapped pool {}", pool.pool);
            return;
        };
        let asset = asset.to_string();
        {
            let mut state = self.state.lock().await;
            state.dex_pools.insert(asset.clone(), pool);
        }
        self.check(&asset).await;
    }

    pub async fn on_trade_completed(&self, trade: &Trade) {
        let mut state = self.state.lock().await;
        state.windows.observe_trade(&trade.window_id, trade.pnl_pct);
    }

    /// Re-run the profitability predicate for one asset using the latest
    /// snapshot of both venues. Missing data simply means no signal.
    async fn check(&self, asset: &str) {
        let emissions = {
            let mut state = self.state.lock().await;
            let (Some(book), Some(pool)) =
                (state.cex_books.get(asset), state.dex_pools.get(asset))
            else {
                return;
            };
            let (Some(cex_bid), Some(cex_ask)) = (book.best_bid(), book.best_ask()) else {
                return;
            };
            let dex_mid = pool.price_mid;
            if dex_mid <= Decimal::ZERO {
                return;
            }

            let mut emissions: Vec<Opportunity> = Vec::new();
            let now = Utc::now();

            // cex→dex: buy the CEX ask, sell into the pool.
            if dex_mid > cex_ask {
                let gross = (dex_mid - cex_ask) / cex_ask * dec!(100);
                if let Some(opp) = self.evaluate(
                    &mut state.windows,
                    asset,
                    Direction::CexToDex,
                    cex_ask,
                    dex_mid,
                    gross,
                    now,
                ) {
                    emissions.push(opp);
                }
            }

            // dex→cex: buy from the pool, sell the CEX bid.
            if cex_bid > dex_mid {
                let gross = (cex_bid - dex_mid) / dex_mid * dec!(100);
                if let Some(opp) = self.evaluate(
                    &mut state.windows,
                    asset,
                    Direction::DexToCex,
                    cex_bid,
                    dex_mid,
                    gross,
                    now,
                ) {
                    emissions.push(opp);
                }
            }
            emissions
        };

        for opp in emissions {
            self.bus.publish(BusEvent::Opportunity(opp)).await;
        }
    }

    fn evaluate(
        &self,
        windows: &mut WindowManager,
        asset: &str,
        direction: Direction,
        cex_price: Decimal,
        dex_price: Decimal,
        gross_spread_pct: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let predicted_pnl_pct = gross_spread_pct - self.cfg.total_cost_pct();
        if predicted_pnl_pct < self.cfg.emit_threshold_pct {
            return None;
        }

        let window_id = windows.observe_signal(asset, direction, now);
        let opp = Opportunity {
            id: Uuid::new_v4().to_string(),
            asset: asset.to_string(),
            direction,
            cex_price,
            dex_price,
            spread_pct: gross_spread_pct,
            predicted_pnl_pct,
            size: self.cfg.default_size,
            detected_at: now,
            window_id,
        };
        info!(
            "💡 opportunity {} {} spread={:.4}% net={:.4}% (cex={} dex={})",
            asset,
            direction.as_str(),
            gross_spread_pct,
            predicted_pnl_pct,
            cex_price,
            dex_price,
        );
        Some(opp)
    }

    /// Sweep idle windows shut; driven by the status monitor.
    pub async fn close_idle_windows(&self) {
        let mut state = self.state.lock().await;
        state.windows.close_idle(Utc::now());
    }

    pub async fn open_windows(&self) -> Vec<Window> {
        self.state.lock().await.windows.open_windows()
    }

    pub async fn closed_windows(&self) -> Vec<Window> {
        self.state.lock().await.windows.closed_windows()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
