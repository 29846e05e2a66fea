pub mod arb;
pub mod gateway;

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// --- Configuration Structs ---

/// CEX venue endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CexSettings {
    pub venue: String,
    pub ws_public_url: String,
    pub ws_private_url: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
}

/// DEX chain endpoints. `swap_submit_url` is the opaque swap-submitter
/// sidecar; without it live swaps are refused (reported, not fatal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexSettings {
    pub rpc_url: String,
    pub ws_url: String,
    pub swap_submit_url: Option<String>,
}

/// Top-level application settings, loaded once in the composition root and
/// threaded into every component. No global singletons.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cex: CexSettings,
    pub dex: DexSettings,
    /// Canonical asset labels, e.g. "SOL-USD".
    pub assets: Vec<String>,
    /// Canonical asset label → CEX venue symbol (e.g. "SOL-USD" → "solusd").
    /// Single source of truth for pairing venue feeds.
    pub symbol_map: HashMap<String, String>,
    /// Canonical asset label → DEX pool address.
    pub pool_addresses: HashMap<String, String>,
    pub observe_only: bool,
    pub max_position_size_usd: Decimal,
    pub daily_loss_limit_usd: Decimal,
    pub cex_fee_pct: Decimal,
    pub dex_fee_pct: Decimal,
    pub haircut_pct: Decimal,
    pub emit_threshold_pct: Decimal,
    pub staleness_threshold_sec: u64,
    pub window_grace_sec: u64,
    pub priority_fee_lamports: u64,
    pub gateway_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        let assets = vec![
            "SOL-USD".to_string(),
            "BTC-USD".to_string(),
            "ETH-USD".to_string(),
        ];
        let mut symbol_map = HashMap::new();
        for asset in &assets {
            symbol_map.insert(asset.clone(), asset.to_lowercase().replace('-', ""));
        }
        let mut pool_addresses = HashMap::new();
        // Orca Whirlpool SOL/USDC
        pool_addresses.insert(
            "SOL-USD".to_string(),
            "HJPjoWUrhoZzkNfRpHuieeFk9WcZWjwy6PBjZ81ngndJ".to_string(),
        );

        Self {
            cex: CexSettings {
                venue: "gemini".to_string(),
                ws_public_url: "wss://api.gemini.com/v2/marketdata".to_string(),
                ws_private_url: "wss://api.gemini.com/v1/order/events".to_string(),
                base_url: "https://api.gemini.com".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
            },
            dex: DexSettings {
                rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
                ws_url: "wss://api.mainnet-beta.solana.com".to_string(),
                swap_submit_url: None,
            },
            assets,
            symbol_map,
            pool_addresses,
            observe_only: true,
            max_position_size_usd: dec!(1000),
            daily_loss_limit_usd: dec!(500),
            cex_fee_pct: dec!(0.35),
            dex_fee_pct: dec!(0.30),
            haircut_pct: dec!(0.75),
            emit_threshold_pct: dec!(0.10),
            staleness_threshold_sec: 10,
            window_grace_sec: 20,
            priority_fee_lamports: 5_000,
            gateway_addr: ([127, 0, 0, 1], 8080).into(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    /// Malformed JSON for the map keys is a configuration error — the only
    /// kind of failure this process treats as fatal.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut s = Self::default();

        if let Ok(v) = env::var("ARB_CEX_VENUE")          { s.cex.venue = v; }
        if let Ok(v) = env::var("ARB_CEX_WS_PUBLIC_URL")  { s.cex.ws_public_url = v; }
        if let Ok(v) = env::var("ARB_CEX_WS_PRIVATE_URL") { s.cex.ws_private_url = v; }
        if let Ok(v) = env::var("ARB_CEX_BASE_URL")       { s.cex.base_url = v; }
        if let Ok(v) = env::var("ARB_CEX_API_KEY")        { s.cex.api_key = v; }
        if let Ok(v) = env::var("ARB_CEX_API_SECRET")     { s.cex.api_secret = v; }
        if let Ok(v) = env::var("ARB_DEX_RPC_URL")        { s.dex.rpc_url = v; }
        if let Ok(v) = env::var("ARB_DEX_WS_URL")         { s.dex.ws_url = v; }
        if let Ok(v) = env::var("ARB_DEX_SWAP_SUBMIT_URL") { s.dex.swap_submit_url = Some(v); }

        if let Ok(v) = env::var("ARB_ASSETS") {
            s.assets = v.split(',').map(|a| a.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("ARB_SYMBOL_MAP") {
            s.symbol_map = serde_json::from_str(&v).context("parsing ARB_SYMBOL_MAP")?;
        }
        if let Ok(v) = env::var("ARB_POOL_ADDRESSES") {
            s.pool_addresses =
                serde_json::from_str(&v).context("parsing ARB_POOL_ADDRESSES")?;
        }

        if let Ok(v) = env::var("ARB_OBSERVE_ONLY") {
            s.observe_only = v != "0" && v.to_lowercase() != "false";
        }
        if let Ok(v) = env::var("ARB_MAX_POSITION_SIZE_USD") {
            if let Ok(d) = v.parse() { s.max_position_size_usd = d; }
        }
        if let Ok(v) = env::var("ARB_DAILY_LOSS_LIMIT_USD") {
            if let Ok(d) = v.parse() { s.daily_loss_limit_usd = d; }
        }
        if let Ok(v) = env::var("ARB_CEX_FEE_PCT")        { if let Ok(d) = v.parse() { s.cex_fee_pct = d; } }
        if let Ok(v) = env::var("ARB_DEX_FEE_PCT")        { if let Ok(d) = v.parse() { s.dex_fee_pct = d; } }
        if let Ok(v) = env::var("ARB_HAIRCUT_PCT")        { if let Ok(d) = v.parse() { s.haircut_pct = d; } }
        if let Ok(v) = env::var("ARB_EMIT_THRESHOLD_PCT") { if let Ok(d) = v.parse() { s.emit_threshold_pct = d; } }
        if let Ok(v) = env::var("ARB_STALENESS_THRESHOLD_SEC") { if let Ok(n) = v.parse() { s.staleness_threshold_sec = n; } }
        if let Ok(v) = env::var("ARB_WINDOW_GRACE_SEC")   { if let Ok(n) = v.parse() { s.window_grace_sec = n; } }
        if let Ok(v) = env::var("ARB_PRIORITY_FEE_LAMPORTS") { if let Ok(n) = v.parse() { s.priority_fee_lamports = n; } }
        if let Ok(v) = env::var("ARB_GATEWAY_ADDR") {
            s.gateway_addr = v.parse().context("parsing ARB_GATEWAY_ADDR")?;
        }

        Ok(s)
    }

    /// CEX venue symbol for a canonical asset label.
    pub fn venue_symbol(&self, asset: &str) -> Option<&str> {
        self.symbol_map.get(asset).map(|s| s.as_str())
    }
}
