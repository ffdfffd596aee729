// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Round to `dp` decimal places (5 for prices, 2 for RSI and money).
pub fn round_dp(x: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (x * f).round() / f
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel { pub price: f64, pub size: i64 }

/// Three levels per side. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook { pub bids: [PriceLevel; 3], pub asks: [PriceLevel; 3] }

impl OrderBook {
    pub fn best_bid(&self) -> PriceLevel { self.bids[0] }
    pub fn best_ask(&self) -> PriceLevel { self.asks[0] }
    pub fn spread(&self) -> f64 { self.best_ask().price - self.best_bid().price }
}

/// One synthesized minute of market data. Never mutated after the synthesizer returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub rsi: f64,
    pub daily_volume: i64,
    pub minute_index: u64,
    pub order_book: OrderBook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action { Buy, Sell, Pass }

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "BUY", Action::Sell => "SELL", Action::Pass => "PASS" }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision { pub action: Action, pub rationale: String }

impl Decision {
    pub fn new(action: Action, rationale: impl Into<String>) -> Self {
        Self { action, rationale: rationale.into() }
    }
    pub fn pass(rationale: impl Into<String>) -> Self { Self::new(Action::Pass, rationale) }
}

/// Ledger entry kinds. A SELL decision is recorded as the close of the whole lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryAction { Buy, CloseLong }

impl EntryAction {
    pub fn as_str(&self) -> &'static str {
        match self { EntryAction::Buy => "BUY", EntryAction::CloseLong => "CLOSE_LONG" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub minute_index: u64,
    pub action: EntryAction,
    pub units: i64,
    pub price: f64,
    pub fee: f64,
    /// `-fee` for a BUY, realized net P&L for a CLOSE_LONG.
    pub pnl: f64,
    pub rationale: String,
}

impl LedgerEntry {
    /// Signed cash movement this entry caused.
    pub fn cash_delta(&self) -> f64 {
        let gross = self.price * self.units as f64;
        match self.action {
            EntryAction::Buy => -(gross + self.fee),
            EntryAction::CloseLong => gross - self.fee,
        }
    }
}

// Recorder events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Snapshot(MarketSnapshot),
    Decision { minute_index: u64, decision: Decision },
    Entry(LedgerEntry),
    Rejected { minute_index: u64, action: Action, reason: String },
    Note(String),
}
