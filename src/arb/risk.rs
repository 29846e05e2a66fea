//! Risk service — the global kill-switch.
//!
//! The sole piece of cross-cutting mutable state in the process. Guarded by
//! an explicit mutex even though the runtime is cooperative, so the design
//! ports unchanged to a multi-threaded runtime.
//!
//! While paused: no external order or swap is issued anywhere; signal
//! emission continues (observable, not actionable); resume is manual only —
//! staleness recovery never auto-resumes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bus::{BusEvent, EventBus, Topic};
use super::types::Trade;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub daily_loss_limit_usd: Decimal,
    /// Data older than this pauses the kill-switch.
    pub staleness_threshold_sec: u64,
    /// Per-venue floor between staleness pause emissions.
    pub pause_debounce_sec: u64,
    pub observe_only: bool,
}

impl RiskConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self {
            daily_loss_limit_usd: settings.daily_loss_limit_usd,
            staleness_threshold_sec: settings.staleness_threshold_sec,
            pause_debounce_sec: 60,
            observe_only: settings.observe_only,
        }
    }
}

// ─────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskState {
    pub is_paused: bool,
    pub pause_reason: String,
    pub daily_pnl: Decimal,
    pub daily_trades: u64,
    pub daily_anchor: DateTime<Utc>,
    pub observe_only: bool,
}

/// Serializable status snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub is_paused: bool,
    pub pause_reason: String,
    pub daily_pnl_usd: Decimal,
    pub daily_trades: u64,
    pub daily_loss_limit_usd: Decimal,
    pub daily_remaining_loss_usd: Decimal,
    pub observe_only: bool,
}

#[derive(Debug)]
struct Inner {
    state: RiskState,
    /// venue → when the last staleness pause was emitted.
    staleness_alerts: HashMap<String, DateTime<Utc>>,
}

fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &now.date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_else(|| now.naive_utc()),
    )
}

// ─────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────

pub struct RiskService {
    cfg: RiskConfig,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl RiskService {
    pub fn new(cfg: RiskConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: RiskState {
                    is_paused: false,
                    pause_reason: String::new(),
                    daily_pnl: Decimal::ZERO,
                    daily_trades: 0,
                    daily_anchor: utc_midnight(now),
                    observe_only: cfg.observe_only,
                },
                staleness_alerts: HashMap::new(),
            }),
            cfg,
            bus,
        })
    }

    /// Wire the daily-aggregate handler onto the bus.
    pub async fn attach(self: &Arc<Self>) {
        let svc = self.clone();
        self.bus
            .subscribe(
                Topic::TradeCompleted,
                "risk-service",
                Arc::new(move |ev| {
                    let svc = svc.clone();
                    Box::pin(async move {
                        if let BusEvent::TradeCompleted(trade) = ev {
                            svc.on_trade_completed(&trade).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    /// Latch the kill-switch. Idempotent: an already-paused service keeps
    /// its original reason and does not re-publish.
    pub async fn trigger_pause(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_paused {
                debug!("☠️ already paused ({}), ignoring: {}", inner.state.pause_reason, reason);
                return;
            }
            inner.state.is_paused = true;
            inner.state.pause_reason = reason.to_string();
        }
        warn!("☠️ KILL-SWITCH TRIGGERED: {}", reason);
        self.bus
            .publish(BusEvent::RiskPaused { reason: reason.to_string(), ts: Utc::now() })
            .await;
    }

    /// Clear the pause. Manual operator action only — nothing in the
    /// process calls this on data recovery.
    pub async fn resume(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.is_paused = false;
            inner.state.pause_reason.clear();
        }
        info!("✅ risk service resumed");
        self.bus.publish(BusEvent::RiskResumed { ts: Utc::now() }).await;
    }

    pub async fn set_observe_only(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        inner.state.observe_only = enabled;
        info!("🔭 observe_only set to {}", enabled);
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.lock().await.state.is_paused
    }

    pub async fn observe_only(&self) -> bool {
        self.inner.lock().await.state.observe_only
    }

    /// Pause when venue data is older than the staleness threshold.
    /// Debounced per venue so a dead feed emits at most one pause per
    /// debounce period. Returns whether this call found the data stale.
    pub async fn check_staleness(&self, venue: &str, last_update: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let age = now - last_update;
        if age <= Duration::seconds(self.cfg.staleness_threshold_sec as i64) {
            return false;
        }

        let should_pause = {
            let mut inner = self.inner.lock().await;
            let debounced = inner
                .staleness_alerts
                .get(venue)
                .map(|t| now - *t < Duration::seconds(self.cfg.pause_debounce_sec as i64))
                .unwrap_or(false);
            if debounced {
                false
            } else {
                inner.staleness_alerts.insert(venue.to_string(), now);
                true
            }
        };

        if should_pause {
            let age_sec = age.num_milliseconds() as f64 / 1000.0;
            self.trigger_pause(&format!("venue {venue} data stale: {age_sec:.1}s"))
                .await;
        }
        true
    }

    /// Accumulate a completed trade into the daily aggregates, resetting
    /// them when the UTC calendar day has rolled over.
    pub async fn on_trade_completed(&self, trade: &Trade) {
        let should_pause = {
            let mut inner = self.inner.lock().await;
            let now = Utc::now();
            if now.date_naive() != inner.state.daily_anchor.date_naive() {
                info!(
                    "🌅 daily rollover: pnl {} over {} trades archived",
                    inner.state.daily_pnl, inner.state.daily_trades
                );
                inner.state.daily_pnl = Decimal::ZERO;
                inner.state.daily_trades = 0;
                inner.state.daily_anchor = utc_midnight(now);
            }

            inner.state.daily_pnl += trade.pnl_abs;
            inner.state.daily_trades += 1;

            inner.state.daily_pnl < -self.cfg.daily_loss_limit_usd
        };

        if should_pause {
            let pnl = self.inner.lock().await.state.daily_pnl;
            self.trigger_pause(&format!("daily loss limit exceeded: {pnl:.2} USD"))
                .await;
        }
    }

    pub async fn get_status(&self) -> RiskStatus {
        let inner = self.inner.lock().await;
        RiskStatus {
            is_paused: inner.state.is_paused,
            pause_reason: inner.state.pause_reason.clone(),
            daily_pnl_usd: inner.state.daily_pnl,
            daily_trades: inner.state.daily_trades,
            daily_loss_limit_usd: self.cfg.daily_loss_limit_usd,
            daily_remaining_loss_usd: self.cfg.daily_loss_limit_usd + inner.state.daily_pnl,
            observe_only: inner.state.observe_only,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arb::types::{Direction, OrderStatus};
    use rust_decimal_macros::dec;

    fn service(limit: Decimal) -> Arc<RiskService> {
        let cfg = RiskConfig {
            daily_loss_limit_usd: limit,
            staleness_threshold_sec: 10,
            pause_debounce_sec: 60,
            observe_only: false,
        };
        RiskService::new(cfg, EventBus::new())
    }

    fn losing_trade(pnl: Decimal) -> Trade {
        Trade {
            trade_id: uuid::Uuid::new_v4().to_string(),
            opportunity_id: uuid::Uuid::new_v4().to_string(),
            asset: "SOL-USD".to_string(),
            direction: Direction::CexToDex,
            size: dec!(10),
            cex_price: dec!(145),
            dex_price: dec!(146),
            fees_total: dec!(1),
            pnl_abs: pnl,
            pnl_pct: Decimal::ZERO,
            latency_ms: 250,
            status: OrderStatus::Filled,
            cex_order_id: None,
            dex_tx_sig: None,
            completed_at: Utc::now(),
            window_id: "w".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stale_data_pauses() {
        let svc = service(dec!(500));
        let stale_ts = Utc::now() - Duration::seconds(15);

        assert!(svc.check_staleness("gemini", stale_ts).await);
        let status = svc.get_status().await;
        assert!(status.is_paused);
        assert!(status.pause_reason.contains("gemini"));
    }

    #[tokio::test]
    async fn test_fresh_data_does_not_pause() {
        let svc = service(dec!(500));
        assert!(!svc.check_staleness("gemini", Utc::now()).await);
        assert!(!svc.is_paused().await);
    }

    #[tokio::test]
    async fn test_staleness_pause_debounced_per_venue() {
        let svc = service(dec!(500));
        let stale_ts = Utc::now() - Duration::seconds(15);

        svc.check_staleness("gemini", stale_ts).await;
        svc.resume().await;
        // Second check inside the debounce period must not re-pause.
        svc.check_staleness("gemini", stale_ts).await;
        assert!(!svc.is_paused().await);
        // A different venue is debounced independently.
        svc.check_staleness("solana", stale_ts).await;
        assert!(svc.is_paused().await);
    }

    #[tokio::test]
    async fn test_daily_loss_limit_pauses() {
        let svc = service(dec!(500));
        svc.on_trade_completed(&losing_trade(dec!(-200))).await;
        assert!(!svc.is_paused().await);

        svc.on_trade_completed(&losing_trade(dec!(-350))).await;
        let status = svc.get_status().await;
        assert!(status.is_paused);
        assert_eq!(status.daily_pnl_usd, dec!(-550));
        assert_eq!(status.daily_trades, 2);
    }

    #[tokio::test]
    async fn test_daily_rollover_resets_aggregates() {
        let svc = service(dec!(500));
        svc.on_trade_completed(&losing_trade(dec!(-400))).await;
        {
            let mut inner = svc.inner.lock().await;
            inner.state.daily_anchor = utc_midnight(Utc::now() - Duration::days(1));
        }
        svc.on_trade_completed(&losing_trade(dec!(-200))).await;

        let status = svc.get_status().await;
        // Yesterday's -400 was archived; only today's -200 counts.
        assert_eq!(status.daily_pnl_usd, dec!(-200));
        assert_eq!(status.daily_trades, 1);
        assert!(!status.is_paused);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_resume_is_manual() {
        let bus = EventBus::new();
        let cfg = RiskConfig {
            daily_loss_limit_usd: dec!(500),
            staleness_threshold_sec: 10,
            pause_debounce_sec: 60,
            observe_only: false,
        };
        let svc = RiskService::new(cfg, bus.clone());

        svc.trigger_pause("first").await;
        svc.trigger_pause("second").await;
        let status = svc.get_status().await;
        assert!(status.is_paused);
        assert_eq!(status.pause_reason, "first");
        assert_eq!(bus.stats().await.get("risk.paused"), Some(&1));

        svc.resume().await;
        assert!(!svc.is_paused().await);
        assert_eq!(bus.stats().await.get("risk.resumed"), Some(&1));
    }
}
