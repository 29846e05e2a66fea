//! In-process typed event bus.
//!
//! Topic → ordered list of subscriber callbacks. All handlers for one
//! publish run concurrently; a handler failure is logged but never cancels
//! its siblings; `publish` awaits completion, so back-pressure falls on the
//! publisher. Delivery is at-least-once within one process lifetime and
//! ordered per publisher. Nothing is persisted — arbitrage state is
//! ephemeral by design.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{BookSnapshot, Opportunity, PoolSnapshot, Trade};

// ─────────────────────────────────────────────────────────
// Topics and events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    CexBook,
    DexPool,
    Opportunity,
    TradeCompleted,
    RiskPaused,
    RiskResumed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::CexBook => "cex.bookUpdate",
            Topic::DexPool => "dex.poolUpdate",
            Topic::Opportunity => "signal.opportunity",
            Topic::TradeCompleted => "trade.completed",
            Topic::RiskPaused => "risk.paused",
            Topic::RiskResumed => "risk.resumed",
        }
    }
}

/// One payload variant per topic — no stringly-typed payloads.
#[derive(Debug, Clone)]
pub enum BusEvent {
    CexBook(BookSnapshot),
    DexPool(PoolSnapshot),
    Opportunity(Opportunity),
    TradeCompleted(Trade),
    RiskPaused { reason: String, ts: DateTime<Utc> },
    RiskResumed { ts: DateTime<Utc> },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::CexBook(_) => Topic::CexBook,
            BusEvent::DexPool(_) => Topic::DexPool,
            BusEvent::Opportunity(_) => Topic::Opportunity,
            BusEvent::TradeCompleted(_) => Topic::TradeCompleted,
            BusEvent::RiskPaused { .. } => Topic::RiskPaused,
            BusEvent::RiskResumed { .. } => Topic::RiskResumed,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────

pub type Handler =
    Arc<dyn Fn(BusEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct EventBus {
    /// Subscriptions happen at startup, but the lock is explicit so the
    /// design ports unchanged to runtime subscription and multi-threaded
    /// runtimes.
    subscribers: Mutex<HashMap<Topic, Vec<(String, Handler)>>>,
    published: Mutex<HashMap<Topic, u64>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
        })
    }

    /// Register a handler for a topic. Idempotency is the caller's
    /// responsibility; subscribing twice delivers twice.
    pub async fn subscribe(&self, topic: Topic, name: &str, handler: Handler) {
        let mut subs = self.subscribers.lock().await;
        subs.entry(topic).or_default().push((name.to_string(), handler));
        debug!("📨 subscribed to {}: {}", topic.as_str(), name);
    }

    /// Deliver an event to every current subscriber of its topic, running
    /// all handlers concurrently and awaiting completion.
    pub async fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        {
            let mut counts = self.published.lock().await;
            *counts.entry(topic).or_insert(0) += 1;
        }

        let handlers: Vec<(String, Handler)> = {
            let subs = self.subscribers.lock().await;
            match subs.get(&topic) {
                Some(hs) => hs.clone(),
                None => {
                    debug!("📨 no subscribers for {}", topic.as_str());
                    return;
                }
            }
        };

        let futs = handlers.into_iter().map(|(name, handler)| {
            let event = event.clone();
            async move {
                if let Err(e) = handler(event).await {
                    warn!("📨 handler '{}' failed on {}: {:?}", name, topic.as_str(), e);
                }
            }
        });
        join_all(futs).await;
    }

    /// Per-topic publish counters, keyed by the external topic name.
    pub async fn stats(&self) -> HashMap<String, u64> {
        let counts = self.published.lock().await;
        counts
            .iter()
            .map(|(t, n)| (t.as_str().to_string(), *n))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn resumed_event() -> BusEvent {
        BusEvent::RiskResumed { ts: Utc::now() }
    }

    fn counting_handler(counter: Arc<AtomicU64>) -> Handler {
        Arc::new(move |_ev| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let c1 = Arc::new(AtomicU64::new(0));
        let c2 = Arc::new(AtomicU64::new(0));
        bus.subscribe(Topic::RiskResumed, "h1", counting_handler(c1.clone())).await;
        bus.subscribe(Topic::RiskResumed, "h2", counting_handler(c2.clone())).await;

        bus.publish(resumed_event()).await;
        bus.publish(resumed_event()).await;

        assert_eq!(c1.load(Ordering::SeqCst), 2);
        assert_eq!(c2.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_cancel_siblings() {
        let bus = EventBus::new();
        let survivor = Arc::new(AtomicU64::new(0));
        bus.subscribe(
            Topic::RiskResumed,
            "failing",
            Arc::new(|_ev| Box::pin(async { anyhow::bail!("boom") })),
        )
        .await;
        bus.subscribe(Topic::RiskResumed, "survivor", counting_handler(survivor.clone()))
            .await;

        bus.publish(resumed_event()).await;
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_h = seen.clone();
        bus.subscribe(
            Topic::RiskPaused,
            "recorder",
            Arc::new(move |ev| {
                let seen = seen_h.clone();
                Box::pin(async move {
                    if let BusEvent::RiskPaused { reason, .. } = ev {
                        seen.lock().await.push(reason);
                    }
                    Ok(())
                })
            }),
        )
        .await;

        for i in 0..8 {
            bus.publish(BusEvent::RiskPaused {
                reason: format!("r{i}"),
                ts: Utc::now(),
            })
            .await;
        }

        let seen = seen.lock().await;
        let expected: Vec<String> = (0..8).map(|i| format!("r{i}")).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn test_stats_count_per_topic() {
        let bus = EventBus::new();
        bus.publish(resumed_event()).await;
        bus.publish(resumed_event()).await;
        bus.publish(BusEvent::RiskPaused { reason: "x".into(), ts: Utc::now() }).await;

        let stats = bus.stats().await;
        assert_eq!(stats.get("risk.resumed"), Some(&2));
        assert_eq!(stats.get("risk.paused"), Some(&1));
        assert_eq!(stats.get("trade.completed"), None);
    }
}
