//! Domain types shared across the arbitrage pipeline.
//!
//! All monetary and size quantities are `rust_decimal::Decimal` — binary
//! floats are confined to latencies and log display. Timestamps are UTC with
//! millisecond precision. Identifiers are opaque UUID strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Which leg buys where. `CexToDex` = buy the CEX ask, sell into the pool;
/// `DexToCex` = buy from the pool, sell the CEX bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CexToDex,
    DexToCex,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::CexToDex => "cex_to_dex",
            Direction::DexToCex => "dex_to_cex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    PartiallyFilled,
    Cancelled,
    Failed,
}

/// Where a pool snapshot's numbers came from. Synthetic snapshots exist only
/// in observe-only mode; downstream gating may refuse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    OnChain,
    Synthetic,
}

// ─────────────────────────────────────────────────────────
// Market data snapshots
// ─────────────────────────────────────────────────────────

/// Canonical CEX L2 book snapshot. Bids descending, asks ascending, each
/// side deduplicated by price, zero sizes removed, top-20 levels retained,
/// and `best_bid < best_ask` whenever both sides are non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub venue: String,
    pub symbol: String,
    pub ts: DateTime<Utc>,
    /// (price, size) pairs, best first.
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub sequence: Option<u64>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }
}

/// Canonical DEX pool snapshot. Reserves and fee must suffice to compute a
/// deterministic quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub program: String,
    pub pool: String,
    pub ts: DateTime<Utc>,
    /// token mint → amount in native units (decimal-normalized).
    pub reserves: HashMap<String, Decimal>,
    pub price_mid: Decimal,
    pub fee_bps: u32,
    pub data_source: DataSource,
}

/// Transient bound quote; valid until `expires_at` and consumed exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub pool: String,
    pub side: Side,
    pub size_in: Decimal,
    pub size_out: Decimal,
    pub exec_price: Decimal,
    pub impact_pct: Decimal,
    pub fee_pct: Decimal,
    pub expires_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Signals and trades
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub asset: String,
    pub direction: Direction,
    pub cex_price: Decimal,
    pub dex_price: Decimal,
    pub spread_pct: Decimal,
    pub predicted_pnl_pct: Decimal,
    pub size: Decimal,
    pub detected_at: DateTime<Utc>,
    pub window_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub opportunity_id: String,
    pub asset: String,
    pub direction: Direction,
    pub size: Decimal,
    /// Realized prices per leg.
    pub cex_price: Decimal,
    pub dex_price: Decimal,
    pub fees_total: Decimal,
    pub pnl_abs: Decimal,
    pub pnl_pct: Decimal,
    pub latency_ms: u64,
    pub status: OrderStatus,
    pub cex_order_id: Option<String>,
    pub dex_tx_sig: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub window_id: String,
}

/// Per-asset time bucket grouping related signals and trades. Opened lazily
/// on the first signal; closed after the idle grace elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub id: String,
    pub asset: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub signals: u64,
    pub trades: u64,
    pub dominant_dir: Option<Direction>,
    pub max_net_pnl_pct: Decimal,
    pub mean_net_pnl_pct: Decimal,
}

// ─────────────────────────────────────────────────────────
// Order acknowledgements (CEX REST)
// ─────────────────────────────────────────────────────────

/// Result of an IOC order placement. Failures are reported via `Err`, never
/// raised fatally; retry policy is the caller's.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub status: String,
    pub raw: serde_json::Value,
}
