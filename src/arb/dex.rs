//! DEX connector — polled pool state, bound quotes, swap submission.
//!
//! Each configured pool is polled (~2 s): raw account bytes come from the
//! chain RPC (`getAccountInfo`, base64), are decoded per the validated
//! layout, and every successful decode publishes a canonical
//! `PoolSnapshot`. A failed fetch or decode marks that pool stale and the
//! loop keeps polling the others — in production mode there is no synthetic
//! substitute. Observe-only mode may synthesize a snapshot, always tagged
//! `DataSource::Synthetic` so downstream gating can refuse it.
//!
//! Swap signing is out of scope: `execute_swap` forwards the parameters to
//! the configured swap-submitter sidecar and reports its signature or error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::amm::{constant_product_quote, decode_mid_price, decode_reserves, PoolKind, PoolLayout};
use super::bus::{BusEvent, EventBus};
use super::types::{DataSource, PoolSnapshot, Quote, Side};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolBinding {
    /// Canonical asset label this pool prices (e.g. "SOL-USD").
    pub asset: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct DexConfig {
    pub rpc_url: String,
    pub swap_submit_url: Option<String>,
    pub pools: Vec<PoolBinding>,
    pub poll_interval_ms: u64,
    /// Quoting depth assumed for concentrated-liquidity pools, in quote
    /// units. CLMM accounts don't carry plain reserves; the bound quote
    /// works against this depth at the decoded mid.
    pub estimated_depth_usd: Decimal,
    pub observe_only: bool,
}

impl DexConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        let pools = settings
            .pool_addresses
            .iter()
            .map(|(asset, address)| PoolBinding {
                asset: asset.clone(),
                address: address.clone(),
            })
            .collect();
        Self {
            rpc_url: settings.dex.rpc_url.clone(),
            swap_submit_url: settings.dex.swap_submit_url.clone(),
            pools,
            poll_interval_ms: 2_000,
            estimated_depth_usd: dec!(1000000),
            observe_only: settings.observe_only,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PoolEntry {
    snapshot: PoolSnapshot,
    stale: bool,
}

pub struct DexConnector {
    cfg: DexConfig,
    layout: PoolLayout,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    /// pool address → latest decoded state. Exclusively owned here;
    /// everyone else sees value snapshots via the bus.
    pools: Mutex<HashMap<String, PoolEntry>>,
    last_update: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DexConnector {
    pub fn new(cfg: DexConfig, layout: PoolLayout, bus: Arc<EventBus>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            cfg,
            layout,
            bus,
            http,
            pools: Mutex::new(HashMap::new()),
            last_update: Mutex::new(HashMap::new()),
        })
    }

    /// Poll loop. One failed pool never blocks the others.
    pub async fn run(self: Arc<Self>) {
        info!(
            "🌊 DEX connector started | program={} pools={} poll={}ms",
            self.layout.program,
            self.cfg.pools.len(),
            self.cfg.poll_interval_ms,
        );

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.poll_interval_ms));
        loop {
            ticker.tick().await;
            for binding in &self.cfg.pools {
                match self.sync_pool(binding).await {
                    Ok(snapshot) => {
                        self.store_snapshot(snapshot.clone()).await;
                        self.bus.publish(BusEvent::DexPool(snapshot)).await;
                    }
                    Err(e) => {
                        warn!("🌊 pool {} sync failed: {:?}", binding.address, e);
                        if self.cfg.observe_only {
                            let synthetic = self.synthesize_snapshot(binding).await;
                            self.store_snapshot(synthetic.clone()).await;
                            self.bus.publish(BusEvent::DexPool(synthetic)).await;
                        } else {
                            self.mark_stale(&binding.address).await;
                        }
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Pool state
    // ─────────────────────────────────────────────────

    async fn sync_pool(&self, binding: &PoolBinding) -> anyhow::Result<PoolSnapshot> {
        let data = self.fetch_account_data(&binding.address).await?;
        let mid = decode_mid_price(&self.layout, &data)
            .with_context(|| format!("decoding pool {}", binding.address))?;

        let (reserve_a, reserve_b) = match &self.layout.kind {
            PoolKind::ConstantProduct { .. } => decode_reserves(&self.layout, &data)?,
            PoolKind::ConcentratedLiquidity { .. } => {
                // Model the bound quote against the configured depth.
                let half = self.cfg.estimated_depth_usd / dec!(2);
                (half, half / mid)
            }
        };

        debug!(
            "🌊 pool {} mid={} a={} b={}",
            &binding.address[..8.min(binding.address.len())],
            mid,
            reserve_a,
            reserve_b,
        );

        let mut reserves = HashMap::new();
        reserves.insert(self.layout.mint_a.clone(), reserve_a);
        reserves.insert(self.layout.mint_b.clone(), reserve_b);

        Ok(PoolSnapshot {
            program: self.layout.program.clone(),
            pool: binding.address.clone(),
            ts: Utc::now(),
            reserves,
            price_mid: mid,
            fee_bps: self.layout.fee_bps,
            data_source: DataSource::OnChain,
        })
    }

    async fn fetch_account_data(&self, address: &str) -> anyhow::Result<Vec<u8>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getAccountInfo",
            "params": [address, { "encoding": "base64" }],
        });
        let resp: Value = self
            .http
            .post(&self.cfg.rpc_url)
            .json(&body)
            .send()
            .await
            .context("getAccountInfo request failed")?
            .json()
            .await
            .context("getAccountInfo response unparseable")?;

        if let Some(err) = resp.get("error") {
            anyhow::bail!("rpc error: {err}");
        }
        let data_b64 = resp
            .pointer("/result/value/data/0")
            .and_then(|v| v.as_str())
            .context("account missing or carries no data")?;
        BASE64.decode(data_b64).context("account data is not base64")
    }

    /// Observe-only stand-in when the chain is unreachable: last known mid
    /// (or a nominal one) with a small variance, always tagged synthetic.
    async fn synthesize_snapshot(&self, binding: &PoolBinding) -> PoolSnapshot {
        let base_mid = {
            let pools = self.pools.lock().await;
            pools
                .get(&binding.address)
                .map(|e| e.snapshot.price_mid)
                .unwrap_or(dec!(164.0))
        };
        let variance = rand::thread_rng().gen_range(-0.008f64..0.008f64);
        let mid = base_mid
            * (Decimal::ONE + Decimal::from_f64(variance).unwrap_or(Decimal::ZERO));

        let half = self.cfg.estimated_depth_usd / dec!(2);
        let mut reserves = HashMap::new();
        reserves.insert(self.layout.mint_a.clone(), half);
        reserves.insert(self.layout.mint_b.clone(), half / mid);

        PoolSnapshot {
            program: self.layout.program.clone(),
            pool: binding.address.clone(),
            ts: Utc::now(),
            reserves,
            price_mid: mid,
            fee_bps: self.layout.fee_bps,
            data_source: DataSource::Synthetic,
        }
    }

    async fn store_snapshot(&self, snapshot: PoolSnapshot) {
        let address = snapshot.pool.clone();
        {
            let mut pools = self.pools.lock().await;
            pools.insert(address.clone(), PoolEntry { snapshot, stale: false });
        }
        self.last_update.lock().await.insert(address, Utc::now());
    }

    async fn mark_stale(&self, address: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools.get_mut(address) {
            entry.stale = true;
        }
    }

    pub async fn is_stale(&self, address: &str) -> bool {
        let pools = self.pools.lock().await;
        pools.get(address).map(|e| e.stale).unwrap_or(true)
    }

    pub async fn last_update_ts(&self, address: &str) -> Option<DateTime<Utc>> {
        self.last_update.lock().await.get(address).copied()
    }

    // ─────────────────────────────────────────────────
    // Quotes
    // ─────────────────────────────────────────────────

    /// Bounded-impact quote against the latest pool state. Returns `None`
    /// when the pool is unknown/stale or the predicted impact exceeds the
    /// slippage cap.
    pub async fn bound_quote(
        &self,
        pool_address: &str,
        side: Side,
        size_in: Decimal,
        slippage_bps: u32,
    ) -> Option<Quote> {
        let (snapshot, stale) = {
            let pools = self.pools.lock().await;
            let entry = pools.get(pool_address)?;
            (entry.snapshot.clone(), entry.stale)
        };
        if stale {
            debug!("🌊 refusing quote on stale pool {}", pool_address);
            return None;
        }

        let reserve_a = *snapshot.reserves.get(&self.layout.mint_a)?;
        let reserve_b = *snapshot.reserves.get(&self.layout.mint_b)?;
        // Buy base: quote in, base out. Sell base: base in, quote out.
        let (reserve_in, reserve_out) = match side {
            Side::Buy => (reserve_a, reserve_b),
            Side::Sell => (reserve_b, reserve_a),
        };

        let quote = match constant_product_quote(reserve_in, reserve_out, size_in, snapshot.fee_bps)
        {
            Ok(q) => q,
            Err(e) => {
                debug!("🌊 quote rejected on {}: {:?}", pool_address, e);
                return None;
            }
        };

        let slippage_cap_pct = Decimal::from(slippage_bps) / dec!(100);
        if quote.impact_pct > slippage_cap_pct {
            warn!(
                "🌊 impact {}% exceeds slippage cap {} bps on {}",
                quote.impact_pct, slippage_bps, pool_address,
            );
            return None;
        }

        Some(Quote {
            pool: pool_address.to_string(),
            side,
            size_in,
            size_out: quote.amount_out,
            exec_price: quote.exec_price,
            impact_pct: quote.impact_pct,
            fee_pct: Decimal::from(snapshot.fee_bps) / dec!(100),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        })
    }

    // ─────────────────────────────────────────────────
    // Swap execution
    // ─────────────────────────────────────────────────

    /// Submit a swap with `min_size_out` as the slippage floor. Signing and
    /// broadcast live in the submitter sidecar; this call reports its
    /// signature or error and never retries.
    pub async fn execute_swap(
        &self,
        pool_address: &str,
        side: Side,
        size_in: Decimal,
        min_size_out: Decimal,
        priority_fee_lamports: u64,
    ) -> anyhow::Result<String> {
        let submit_url = self
            .cfg
            .swap_submit_url
            .as_deref()
            .context("no swap submitter configured")?;

        info!(
            "📤 DEX swap {} {} in pool {}… (min_out={}, priority_fee={})",
            side.as_str(),
            size_in,
            &pool_address[..8.min(pool_address.len())],
            min_size_out,
            priority_fee_lamports,
        );

        let body = json!({
            "pool": pool_address,
            "side": side.as_str(),
            "size_in": size_in.to_string(),
            "min_size_out": min_size_out.to_string(),
            "priority_fee_lamports": priority_fee_lamports,
        });
        let response = self
            .http
            .post(submit_url)
            .json(&body)
            .send()
            .await
            .context("swap submit request failed")?;

        let status = response.status();
        let raw: Value = response.json().await.context("swap submit response unparseable")?;
        if !status.is_success() {
            anyhow::bail!("swap submit rejected {}: {}", status, raw);
        }
        raw.get("signature")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .context("swap submit response missing signature")
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(observe_only: bool) -> Arc<DexConnector> {
        let cfg = DexConfig {
            rpc_url: "http://example/rpc".to_string(),
            swap_submit_url: None,
            pools: vec![PoolBinding {
                asset: "SOL-USD".to_string(),
                address: "PoolAddr111".to_string(),
            }],
            poll_interval_ms: 2_000,
            estimated_depth_usd: dec!(1000000),
            observe_only,
        };
        DexConnector::new(cfg, PoolLayout::whirlpool_sol_usdc(), EventBus::new())
    }

    fn onchain_snapshot(mid: Decimal) -> PoolSnapshot {
        let layout = PoolLayout::whirlpool_sol_usdc();
        let mut reserves = HashMap::new();
        reserves.insert(layout.mint_a.clone(), dec!(500000));
        reserves.insert(layout.mint_b.clone(), dec!(500000) / mid);
        PoolSnapshot {
            program: layout.program,
            pool: "PoolAddr111".to_string(),
            ts: Utc::now(),
            reserves,
            price_mid: mid,
            fee_bps: 30,
            data_source: DataSource::OnChain,
        }
    }

    #[tokio::test]
    async fn test_bound_quote_within_slippage() {
        let conn = connector(false);
        conn.store_snapshot(onchain_snapshot(dec!(145))).await;

        // Buy SOL with 1,000 USDC against 500k depth — tiny impact.
        let quote = conn
            .bound_quote("PoolAddr111", Side::Buy, dec!(1000), 75)
            .await
            .expect("quote should pass the slippage cap");
        assert!(quote.size_out > Decimal::ZERO);
        assert!(quote.impact_pct < dec!(0.75));
        assert_eq!(quote.fee_pct, dec!(0.30));
        assert!(quote.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_bound_quote_rejects_excess_impact() {
        let conn = connector(false);
        conn.store_snapshot(onchain_snapshot(dec!(145))).await;

        // Swapping 40% of the quote reserve blows any reasonable cap.
        let quote = conn
            .bound_quote("PoolAddr111", Side::Buy, dec!(200000), 75)
            .await;
        assert!(quote.is_none());
    }

    #[tokio::test]
    async fn test_stale_pool_refuses_quotes() {
        let conn = connector(false);
        conn.store_snapshot(onchain_snapshot(dec!(145))).await;
        conn.mark_stale("PoolAddr111").await;
        assert!(conn.is_stale("PoolAddr111").await);
        assert!(conn
            .bound_quote("PoolAddr111", Side::Buy, dec!(10), 75)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_pool_is_stale() {
        let conn = connector(false);
        assert!(conn.is_stale("nope").await);
        assert!(conn.bound_quote("nope", Side::Sell, dec!(1), 75).await.is_none());
    }

    #[tokio::test]
    async fn test_synthetic_snapshot_is_tagged() {
        let conn = connector(true);
        let binding = PoolBinding {
            asset: "SOL-USD".to_string(),
            address: "PoolAddr111".to_string(),
        };
        let snap = conn.synthesize_snapshot(&binding).await;
        assert_eq!(snap.data_source, DataSource::Synthetic);
        // Nominal mid ±0.8 %.
        assert!(snap.price_mid > dec!(160) && snap.price_mid < dec!(168));
    }

    #[tokio::test]
    async fn test_swap_without_submitter_is_reported() {
        let conn = connector(false);
        let res = conn
            .execute_swap("PoolAddr111", Side::Sell, dec!(10), dec!(1400), 5000)
            .await;
        assert!(res.is_err());
    }
}
