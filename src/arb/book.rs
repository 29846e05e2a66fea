//! L2 order book ladder for one symbol.
//!
//! Backed by `BTreeMap<Decimal, Decimal>` per side so prices are
//! deduplicated and kept sorted under exact decimal comparison. After every
//! mutation the ladder is truncated to the top 20 levels.

use std::collections::BTreeMap;

use chrono::Utc;
use rust_decimal::Decimal;

use super::types::BookSnapshot;

/// Levels retained per side.
pub const BOOK_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Default)]
pub struct L2Book {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl L2Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole book from a venue snapshot message.
    pub fn apply_snapshot(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) {
        self.bids.clear();
        self.asks.clear();
        // Duplicate prices within one message: last wins (map overwrite).
        for (price, size) in bids {
            self.apply_change(BookSide::Bid, *price, *size);
        }
        for (price, size) in asks {
            self.apply_change(BookSide::Ask, *price, *size);
        }
    }

    /// Apply one incremental (side, price, size) mutation. Zero size removes
    /// the level; anything else sets it.
    pub fn apply_change(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let ladder = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size.is_zero() {
            ladder.remove(&price);
        } else {
            ladder.insert(price, size);
        }
        self.truncate_depth();
    }

    fn truncate_depth(&mut self) {
        // Bids keep the highest 20 prices, asks the lowest 20.
        while self.bids.len() > BOOK_DEPTH {
            if let Some(lowest) = self.bids.keys().next().copied() {
                self.bids.remove(&lowest);
            }
        }
        while self.asks.len() > BOOK_DEPTH {
            if let Some(highest) = self.asks.keys().next_back().copied() {
                self.asks.remove(&highest);
            }
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// A crossed ladder (best_bid >= best_ask) is not publishable; the
    /// connector skips the snapshot and waits for the venue to repair it.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Canonical snapshot: bids descending, asks ascending.
    pub fn snapshot(&self, venue: &str, symbol: &str, sequence: Option<u64>) -> BookSnapshot {
        BookSnapshot {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            ts: Utc::now(),
            bids: self.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
            asks: self.asks.iter().map(|(p, s)| (*p, *s)).collect(),
            sequence,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_book() -> L2Book {
        let mut book = L2Book::new();
        book.apply_snapshot(
            &[(dec!(144.9), dec!(2)), (dec!(145.0), dec!(1)), (dec!(144.5), dec!(3))],
            &[(dec!(145.2), dec!(1)), (dec!(145.1), dec!(4)), (dec!(146.0), dec!(2))],
        );
        book
    }

    #[test]
    fn test_sides_sorted_and_deduplicated() {
        let book = sample_book();
        let snap = book.snapshot("gemini", "solusd", None);

        let bid_prices: Vec<Decimal> = snap.bids.iter().map(|(p, _)| *p).collect();
        let ask_prices: Vec<Decimal> = snap.asks.iter().map(|(p, _)| *p).collect();
        assert_eq!(bid_prices, vec![dec!(145.0), dec!(144.9), dec!(144.5)]);
        assert_eq!(ask_prices, vec![dec!(145.1), dec!(145.2), dec!(146.0)]);

        assert!(snap.best_bid().unwrap() < snap.best_ask().unwrap());
    }

    #[test]
    fn test_zero_size_removes_level() {
        let mut book = sample_book();
        book.apply_change(BookSide::Bid, dec!(145.0), dec!(0));
        assert_eq!(book.best_bid(), Some(dec!(144.9)));
    }

    #[test]
    fn test_duplicate_price_last_wins() {
        let mut book = L2Book::new();
        book.apply_snapshot(
            &[(dec!(100), dec!(1)), (dec!(100), dec!(7))],
            &[(dec!(101), dec!(1))],
        );
        let snap = book.snapshot("gemini", "solusd", None);
        assert_eq!(snap.bids, vec![(dec!(100), dec!(7))]);
    }

    #[test]
    fn test_depth_truncated_to_top_20() {
        let mut book = L2Book::new();
        for i in 0..30i64 {
            book.apply_change(BookSide::Bid, Decimal::from(100 + i), dec!(1));
            book.apply_change(BookSide::Ask, Decimal::from(200 + i), dec!(1));
        }
        let snap = book.snapshot("gemini", "solusd", None);
        assert_eq!(snap.bids.len(), BOOK_DEPTH);
        assert_eq!(snap.asks.len(), BOOK_DEPTH);
        // Bids keep the HIGHEST prices, asks the LOWEST.
        assert_eq!(snap.best_bid(), Some(dec!(129)));
        assert_eq!(snap.best_ask(), Some(dec!(200)));
        assert_eq!(snap.bids.last().map(|(p, _)| *p), Some(dec!(110)));
        assert_eq!(snap.asks.last().map(|(p, _)| *p), Some(dec!(219)));
    }

    #[test]
    fn test_snapshot_replaces_previous_state() {
        let mut book = sample_book();
        book.apply_snapshot(&[(dec!(90), dec!(1))], &[(dec!(91), dec!(1))]);
        assert_eq!(book.best_bid(), Some(dec!(90)));
        assert_eq!(book.best_ask(), Some(dec!(91)));
        let snap = book.snapshot("gemini", "solusd", None);
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn test_crossed_ladder_detected() {
        let mut book = L2Book::new();
        book.apply_change(BookSide::Bid, dec!(101), dec!(1));
        book.apply_change(BookSide::Ask, dec!(100), dec!(1));
        assert!(book.is_crossed());

        book.apply_change(BookSide::Bid, dec!(101), dec!(0));
        book.apply_change(BookSide::Bid, dec!(99), dec!(1));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_exact_decimal_price_identity() {
        let mut book = L2Book::new();
        // 145.10 and 145.1 are the same price level under decimal equality.
        book.apply_change(BookSide::Ask, dec!(145.10), dec!(1));
        book.apply_change(BookSide::Ask, dec!(145.1), dec!(5));
        let snap = book.snapshot("gemini", "solusd", None);
        assert_eq!(snap.asks.len(), 1);
        assert_eq!(snap.asks[0].1, dec!(5));
    }
}
