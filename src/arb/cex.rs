//! CEX connector — reconnecting L2 market data plus IOC order placement.
//!
//! One WebSocket per process maintains the L2 books for a fixed symbol list:
//!
//!   disconnected → connecting → open → subscribed → (error) → reconnecting
//!
//! Reconnect back-off starts at 5 s and climbs linearly to 30 s; a
//! successful subscribe resets it. Every successful book mutation publishes
//! a canonical `BookSnapshot` on the bus.
//!
//! Orders go over REST signed with HMAC-SHA384 of the base64 payload and a
//! monotonically increasing nonce. Order failures are reported to the
//! caller, never fatal to the connector; an authentication rejection halts
//! further order calls but leaves market data untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha384;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::book::{BookSide, L2Book};
use super::bus::{BusEvent, EventBus};
use super::types::{OrderAck, Side};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CexConfig {
    pub venue: String,
    pub ws_public_url: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Venue symbols to subscribe (e.g. "solusd").
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    Subscribed,
    Reconnecting,
}

const BACKOFF_START_SEC: u64 = 5;
const BACKOFF_MAX_SEC: u64 = 30;
const IDLE_PING_SEC: u64 = 30;
const PONG_GRACE_SEC: u64 = 10;

// ─────────────────────────────────────────────────────────
// Request signing
// ─────────────────────────────────────────────────────────

type HmacSha384 = Hmac<Sha384>;

/// HMAC-SHA384 over the base64-encoded JSON payload, hex signature, with a
/// monotonically increasing nonce stamped into every payload.
struct OrderSigner {
    api_key: String,
    api_secret: String,
    nonce: AtomicU64,
}

impl OrderSigner {
    fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
            nonce: AtomicU64::new(Utc::now().timestamp_millis() as u64),
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    fn sign(&self, payload: &Value) -> anyhow::Result<(String, String)> {
        let payload_json = serde_json::to_vec(payload).context("encoding order payload")?;
        let payload_b64 = BASE64.encode(payload_json);

        let mut mac = HmacSha384::new_from_slice(self.api_secret.as_bytes())
            .context("building HMAC from api secret")?;
        mac.update(payload_b64.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok((payload_b64, signature))
    }
}

// ─────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────

pub struct CexConnector {
    cfg: CexConfig,
    bus: Arc<EventBus>,
    books: Mutex<HashMap<String, L2Book>>,
    last_update: Mutex<HashMap<String, DateTime<Utc>>>,
    state: Mutex<ConnState>,
    sequence: AtomicU64,
    dropped_frames: AtomicU64,
    auth_halted: AtomicBool,
    signer: OrderSigner,
    http: reqwest::Client,
}

impl CexConnector {
    pub fn new(cfg: CexConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let signer = OrderSigner::new(cfg.api_key.clone(), cfg.api_secret.clone());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            cfg,
            bus,
            books: Mutex::new(HashMap::new()),
            last_update: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnState::Disconnected),
            sequence: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            auth_halted: AtomicBool::new(false),
            signer,
            http,
        })
    }

    // ─────────────────────────────────────────────────
    // Reconnect loop
    // ─────────────────────────────────────────────────

    /// Connector main loop: connect, stream, reconnect forever.
    pub async fn run(self: Arc<Self>) {
        info!(
            "📡 CEX connector started | venue={} symbols={:?}",
            self.cfg.venue, self.cfg.symbols,
        );

        let mut backoff = BACKOFF_START_SEC;
        loop {
            self.set_state(ConnState::Connecting).await;
            match self.connect_and_stream(&mut backoff).await {
                Ok(()) => info!("📡 {} WS closed normally", self.cfg.venue),
                Err(e) => warn!("📡 {} WS error: {:?}", self.cfg.venue, e),
            }

            self.set_state(ConnState::Reconnecting).await;
            info!("🔄 reconnecting {} WS in {}s", self.cfg.venue, backoff);
            sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff + BACKOFF_START_SEC).min(BACKOFF_MAX_SEC);
        }
    }

    async fn connect_and_stream(&self, backoff: &mut u64) -> anyhow::Result<()> {
        let url = &self.cfg.ws_public_url;
        info!(%url, "📡 connecting {} WS", self.cfg.venue);

        let connect_result =
            tokio::time::timeout(Duration::from_secs(10), connect_async(url)).await;
        let (ws, response) = match connect_result {
            Ok(Ok((ws, resp))) => (ws, resp),
            Ok(Err(e)) => anyhow::bail!("WS connect error: {:?}", e),
            Err(_) => anyhow::bail!("WS connection timeout"),
        };
        info!("✅ {} WS connected (status={:?})", self.cfg.venue, response.status());
        self.set_state(ConnState::Open).await;

        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "type": "subscribe",
            "subscriptions": [{ "name": "l2", "symbols": self.cfg.symbols }],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("WS subscribe failed")?;
        info!("📤 subscribed l2: {:?}", self.cfg.symbols);
        self.set_state(ConnState::Subscribed).await;
        *backoff = BACKOFF_START_SEC;

        // Read loop with idle-triggered heartbeat: no frame for 30 s sends a
        // ping; no reply within 10 more treats the socket as dead.
        let mut awaiting_pong = false;
        loop {
            let idle = Duration::from_secs(if awaiting_pong { PONG_GRACE_SEC } else { IDLE_PING_SEC });
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            awaiting_pong = false;
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            awaiting_pong = false;
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("📡 {} WS closed by server", self.cfg.venue);
                            break;
                        }
                        Some(Err(e)) => anyhow::bail!("WS read error: {:?}", e),
                        None => break,
                        _ => {}
                    }
                }
                _ = sleep(idle) => {
                    if awaiting_pong {
                        anyhow::bail!("heartbeat timeout: no pong within {}s", PONG_GRACE_SEC);
                    }
                    write.send(Message::Ping(Vec::new())).await.context("WS ping failed")?;
                    awaiting_pong = true;
                }
            }
        }
        Ok(())
    }

    async fn set_state(&self, next: ConnState) {
        *self.state.lock().await = next;
    }

    // ─────────────────────────────────────────────────
    // Frame handling
    // ─────────────────────────────────────────────────

    async fn handle_text(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            self.drop_frame("unparseable frame");
            return;
        };
        let values = if value.is_array() {
            value.as_array().cloned().unwrap_or_default()
        } else {
            vec![value]
        };
        for val in &values {
            self.handle_frame(val).await;
        }
    }

    /// Apply one venue frame to the owned book. A full `snapshot` replaces
    /// the ladder; an update mutates (side, price, size) levels with
    /// size 0 meaning removal. Malformed frames are dropped and counted;
    /// the connector stays alive.
    async fn handle_frame(&self, val: &Value) {
        let frame_type = val.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        match frame_type {
            "snapshot" => {
                let Some(symbol) = val.get("symbol").and_then(|v| v.as_str()) else {
                    self.drop_frame("snapshot without symbol");
                    return;
                };
                let Some(bids) = parse_levels(val.get("bids")) else {
                    self.drop_frame("snapshot with bad bids");
                    return;
                };
                let Some(asks) = parse_levels(val.get("asks")) else {
                    self.drop_frame("snapshot with bad asks");
                    return;
                };
                let symbol = symbol.to_lowercase();
                {
                    let mut books = self.books.lock().await;
                    books.entry(symbol.clone()).or_default().apply_snapshot(&bids, &asks);
                }
                self.after_mutation(&symbol).await;
            }
            "update" | "l2_updates" => {
                let Some(symbol) = val.get("symbol").and_then(|v| v.as_str()) else {
                    self.drop_frame("update without symbol");
                    return;
                };
                let Some(changes) = parse_changes(val.get("changes")) else {
                    self.drop_frame("update with bad changes");
                    return;
                };
                if changes.is_empty() {
                    return;
                }
                let symbol = symbol.to_lowercase();
                {
                    let mut books = self.books.lock().await;
                    let book = books.entry(symbol.clone()).or_default();
                    for (side, price, size) in changes {
                        book.apply_change(side, price, size);
                    }
                }
                self.after_mutation(&symbol).await;
            }
            // Heartbeats and auction events are expected noise.
            _ => {}
        }
    }

    /// Stamp freshness and publish the canonical snapshot. A crossed ladder
    /// is not publishable; wait for the venue to repair it.
    async fn after_mutation(&self, symbol: &str) {
        {
            let mut last = self.last_update.lock().await;
            last.insert(symbol.to_string(), Utc::now());
        }

        let snapshot = {
            let books = self.books.lock().await;
            let Some(book) = books.get(symbol) else { return };
            if book.is_empty() {
                return;
            }
            if book.is_crossed() {
                self.drop_frame("crossed ladder");
                return;
            }
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            book.snapshot(&self.cfg.venue, symbol, Some(seq))
        };
        self.bus.publish(BusEvent::CexBook(snapshot)).await;
    }

    fn drop_frame(&self, why: &str) {
        self.dropped_frames.fetch_add(1, Ordering::SeqCst);
        debug!("🗑️ {} frame dropped: {}", self.cfg.venue, why);
    }

    // ─────────────────────────────────────────────────
    // Read access
    // ─────────────────────────────────────────────────

    pub async fn best_bid_ask(&self, symbol: &str) -> Option<(Decimal, Decimal)> {
        let books = self.books.lock().await;
        let book = books.get(symbol)?;
        Some((book.best_bid()?, book.best_ask()?))
    }

    pub async fn last_update_ts(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_update.lock().await.get(symbol).copied()
    }

    pub async fn state(&self) -> ConnState {
        *self.state.lock().await
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::SeqCst)
    }

    pub fn is_auth_halted(&self) -> bool {
        self.auth_halted.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────
    // Order placement
    // ─────────────────────────────────────────────────

    /// Place an immediate-or-cancel limit order. Never retries; the retry
    /// policy belongs to the caller. Any failure is an `Err` the caller
    /// inspects — nothing here can take the connector down.
    pub async fn place_ioc_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
        client_order_id: &str,
    ) -> anyhow::Result<OrderAck> {
        if self.auth_halted.load(Ordering::SeqCst) {
            anyhow::bail!("order calls halted after authentication rejection");
        }
        if self.signer.api_key.is_empty() || self.signer.api_secret.is_empty() {
            anyhow::bail!("no CEX credentials configured");
        }

        let payload = json!({
            "request": "/v1/order/new",
            "nonce": self.signer.next_nonce(),
            "symbol": symbol,
            "amount": quantity.to_string(),
            "price": limit_price.to_string(),
            "side": side.as_str(),
            "type": "exchange limit",
            "options": ["immediate-or-cancel"],
            "client_order_id": client_order_id,
        });
        let (payload_b64, signature) = self.signer.sign(&payload)?;

        info!(
            "📤 IOC {} {} {}@{} (client_id={})",
            side.as_str(), symbol, quantity, limit_price, client_order_id,
        );

        let response = self
            .http
            .post(format!("{}/v1/order/new", self.cfg.base_url))
            .header("Content-Type", "text/plain")
            .header("X-GEMINI-APIKEY", &self.signer.api_key)
            .header("X-GEMINI-PAYLOAD", payload_b64)
            .header("X-GEMINI-SIGNATURE", signature)
            .send()
            .await
            .context("order request failed")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            self.auth_halted.store(true, Ordering::SeqCst);
            anyhow::bail!("order rejected with auth failure {}: {}", status, body);
        }
        if !status.is_success() {
            anyhow::bail!("order rejected {}: {}", status, body);
        }

        let raw: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        let venue_order_id = raw
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(OrderAck {
            client_order_id: client_order_id.to_string(),
            venue_order_id,
            status: "accepted".to_string(),
            raw,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Frame parsing helpers
// ─────────────────────────────────────────────────────────

fn parse_decimal(v: &Value) -> Option<Decimal> {
    if let Some(s) = v.as_str() {
        return s.trim().parse().ok();
    }
    v.as_f64().and_then(Decimal::from_f64)
}

fn parse_levels(v: Option<&Value>) -> Option<Vec<(Decimal, Decimal)>> {
    let arr = v?.as_array()?;
    let mut levels = Vec::with_capacity(arr.len());
    for level in arr {
        let pair = level.as_array()?;
        let price = parse_decimal(pair.first()?)?;
        let size = parse_decimal(pair.get(1)?)?;
        levels.push((price, size));
    }
    Some(levels)
}

fn parse_changes(v: Option<&Value>) -> Option<Vec<(BookSide, Decimal, Decimal)>> {
    let arr = v?.as_array()?;
    let mut changes = Vec::with_capacity(arr.len());
    for change in arr {
        let triple = change.as_array()?;
        let side = match triple.first()?.as_str()? {
            "buy" | "bid" => BookSide::Bid,
            "sell" | "ask" => BookSide::Ask,
            _ => return None,
        };
        let price = parse_decimal(triple.get(1)?)?;
        let size = parse_decimal(triple.get(2)?)?;
        changes.push((side, price, size));
    }
    Some(changes)
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn connector() -> (Arc<EventBus>, Arc<CexConnector>) {
        let bus = EventBus::new();
        let cfg = CexConfig {
            venue: "gemini".to_string(),
            ws_public_url: "wss://example/marketdata".to_string(),
            base_url: "https://example".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            symbols: vec!["solusd".to_string()],
        };
        let conn = CexConnector::new(cfg, bus.clone());
        (bus, conn)
    }

    fn snapshot_frame() -> Value {
        json!({
            "type": "snapshot",
            "symbol": "solusd",
            "bids": [["144.9", "2.0"], ["145.0", "1.5"]],
            "asks": [["145.2", "3.0"], ["145.1", "1.0"]],
        })
    }

    #[tokio::test]
    async fn test_snapshot_then_update_maintains_book() {
        let (bus, conn) = connector();
        conn.handle_frame(&snapshot_frame()).await;
        assert_eq!(
            conn.best_bid_ask("solusd").await,
            Some((dec!(145.0), dec!(145.1)))
        );

        // Remove best ask, improve best bid.
        conn.handle_frame(&json!({
            "type": "l2_updates",
            "symbol": "solusd",
            "changes": [["sell", "145.1", "0"], ["buy", "145.05", "2.0"]],
        }))
        .await;
        assert_eq!(
            conn.best_bid_ask("solusd").await,
            Some((dec!(145.05), dec!(145.2)))
        );

        let stats = bus.stats().await;
        assert_eq!(stats.get("cex.bookUpdate"), Some(&2));
        assert!(conn.last_update_ts("solusd").await.is_some());
    }

    #[tokio::test]
    async fn test_crossed_ladder_not_published() {
        let (bus, conn) = connector();
        conn.handle_frame(&snapshot_frame()).await;
        let before = conn.dropped_frames();

        // A bid through the best ask crosses the ladder.
        conn.handle_frame(&json!({
            "type": "l2_updates",
            "symbol": "solusd",
            "changes": [["buy", "146.0", "1.0"]],
        }))
        .await;

        assert_eq!(bus.stats().await.get("cex.bookUpdate"), Some(&1));
        assert_eq!(conn.dropped_frames(), before + 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_not_fatal() {
        let (bus, conn) = connector();
        conn.handle_text("not even json").await;
        conn.handle_frame(&json!({"type": "update", "symbol": "solusd", "changes": [["buy", "abc", "1"]]}))
            .await;
        assert_eq!(conn.dropped_frames(), 2);
        assert!(bus.stats().await.get("cex.bookUpdate").is_none());
    }

    #[tokio::test]
    async fn test_order_without_credentials_is_reported() {
        let bus = EventBus::new();
        let cfg = CexConfig {
            venue: "gemini".to_string(),
            ws_public_url: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            symbols: vec![],
        };
        let conn = CexConnector::new(cfg, bus);
        let res = conn
            .place_ioc_order("solusd", Side::Buy, dec!(1), dec!(145), "t-1")
            .await;
        assert!(res.is_err());
    }

    #[test]
    fn test_signer_nonces_strictly_increase() {
        let signer = OrderSigner::new("k".to_string(), "s".to_string());
        let a = signer.next_nonce();
        let b = signer.next_nonce();
        let c = signer.next_nonce();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_signature_is_sha384_hex_over_base64_payload() {
        let signer = OrderSigner::new("k".to_string(), "top-secret".to_string());
        let payload = json!({"request": "/v1/order/new", "nonce": 1});
        let (payload_b64, signature) = signer.sign(&payload).unwrap();

        // Payload round-trips through base64.
        let decoded = BASE64.decode(&payload_b64).unwrap();
        let round: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(round, payload);

        // SHA-384 → 48 bytes → 96 hex chars, and stable for fixed input.
        assert_eq!(signature.len(), 96);
        let (_, again) = signer.sign(&payload).unwrap();
        assert_eq!(signature, again);
    }

    #[test]
    fn test_parse_levels_accepts_strings_and_numbers() {
        let levels = parse_levels(Some(&json!([["145.1", "2"], [145.2, 3.5]]))).unwrap();
        assert_eq!(levels[0], (dec!(145.1), dec!(2)));
        assert_eq!(levels[1].1, dec!(3.5));
        assert!(parse_levels(Some(&json!([["x", "2"]]))).is_none());
    }
}
