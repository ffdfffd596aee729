// ===============================
// src/ledger.rs (cash, position & trade history)
// ===============================
//
// Long-only, single lot. BUY adds a fixed trade size, SELL closes everything.
// State changes only through `ExecutionLedger::apply`; a rejected decision leaves
// cash, position and history exactly as they were.
//

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::domain::{round_dp, Action, Decision, EntryAction, LedgerEntry};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("Cannot BUY: insufficient funds (required {required:.2}, available {available:.2})")]
    InsufficientFunds { required: f64, available: f64 },
    #[error("Cannot SELL: no current long position to close")]
    NoPositionToClose,
}

impl LedgerError {
    pub fn label(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::NoPositionToClose => "no_position",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    pub starting_cash: f64,
    pub trade_size: i64,
    /// Fee per unit traded.
    pub fee_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self { Self { starting_cash: 10_000.0, trade_size: 10_000, fee_rate: 0.00002 } }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerState {
    cash_balance: f64,
    position_units: i64,
    /// Newest first.
    history: Vec<LedgerEntry>,
}

impl LedgerState {
    pub fn cash_balance(&self) -> f64 { self.cash_balance }
    pub fn position_units(&self) -> i64 { self.position_units }
    pub fn history(&self) -> &[LedgerEntry] { &self.history }
}

pub struct ExecutionLedger {
    cfg: LedgerConfig,
    state: LedgerState,
}

impl ExecutionLedger {
    pub fn new(cfg: LedgerConfig) -> Self {
        let state = LedgerState { cash_balance: cfg.starting_cash, position_units: 0, history: Vec::new() };
        Self { cfg, state }
    }

    pub fn config(&self) -> &LedgerConfig { &self.cfg }
    pub fn state(&self) -> &LedgerState { &self.state }

    /// Apply one decision at `price`. PASS returns `Ok(None)`.
    pub fn apply(&mut self, decision: &Decision, price: f64, minute_index: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let entry = match decision.action {
            Action::Pass => return Ok(None),
            Action::Buy => self.buy(price, minute_index, &decision.rationale)?,
            Action::Sell => self.close_long(price, minute_index)?,
        };
        self.state.history.insert(0, entry.clone());
        Ok(Some(entry))
    }

    fn buy(&mut self, price: f64, minute_index: u64, rationale: &str) -> Result<LedgerEntry, LedgerError> {
        let size = self.cfg.trade_size;
        let cost = price * size as f64;
        let fee = size as f64 * self.cfg.fee_rate;
        let required = cost + fee;
        if self.state.cash_balance < required {
            return Err(LedgerError::InsufficientFunds { required, available: self.state.cash_balance });
        }

        self.state.cash_balance -= required;
        self.state.position_units += size;
        Ok(LedgerEntry {
            timestamp: Utc::now(),
            minute_index,
            action: EntryAction::Buy,
            units: size,
            price,
            fee,
            pnl: -fee,
            rationale: rationale.to_string(),
        })
    }

    fn close_long(&mut self, price: f64, minute_index: u64) -> Result<LedgerEntry, LedgerError> {
        let units = self.state.position_units;
        if units <= 0 {
            return Err(LedgerError::NoPositionToClose);
        }

        let fee = units as f64 * self.cfg.fee_rate;
        let net_proceeds = price * units as f64 - fee;
        let pnl = net_proceeds - self.open_cost();

        self.state.cash_balance += net_proceeds;
        self.state.position_units = 0;
        Ok(LedgerEntry {
            timestamp: Utc::now(),
            minute_index,
            action: EntryAction::CloseLong,
            units,
            price,
            fee,
            pnl,
            rationale: format!("Closed long position. Net P&L (incl. fees): ${:.2}", pnl),
        })
    }

    /// Cost (price x units + fee) of the BUYs since the last close.
    pub fn open_cost(&self) -> f64 {
        self.state
            .history
            .iter()
            .take_while(|e| e.action != EntryAction::CloseLong)
            .map(|e| e.price * e.units as f64 + e.fee)
            .sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.state.history.iter().filter(|e| e.action == EntryAction::CloseLong).map(|e| e.pnl).sum()
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        if self.state.position_units == 0 {
            return 0.0;
        }
        self.state.position_units as f64 * mark - self.open_cost()
    }

    pub fn total_pnl(&self, mark: f64) -> f64 { self.realized_pnl() + self.unrealized_pnl(mark) }

    /// Starting cash plus every entry's cash movement, oldest first.
    pub fn replay_cash(&self) -> f64 {
        self.state.history.iter().rev().fold(self.cfg.starting_cash, |cash, e| cash + e.cash_delta())
    }
}

/// `+$1,234.56`, `-$0.20`, `$0.00`
pub fn format_pnl(value: f64) -> String {
    let v = round_dp(value, 2);
    let cents = (v.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let body = format!("${}.{:02}", grouped, cents % 100);
    if cents == 0 {
        body
    } else if v > 0.0 {
        format!("+{body}")
    } else {
        format!("-{body}")
    }
}

pub fn format_price(px: f64) -> String { format!("{:.5}", px) }

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const EPS: f64 = 1e-6;

    fn ledger(cash: f64) -> ExecutionLedger {
        ExecutionLedger::new(LedgerConfig { starting_cash: cash, ..LedgerConfig::default() })
    }

    fn buy() -> Decision { Decision::new(Action::Buy, "RSI 25.00 below 30") }
    fn sell() -> Decision { Decision::new(Action::Sell, "RSI 72.00 above 70") }

    #[test]
    fn buy_rejected_without_funds() {
        let mut l = ledger(10_000.0);
        let err = l.apply(&buy(), 1.10000, 1).unwrap_err();
        match err {
            LedgerError::InsufficientFunds { required, available } => {
                assert!((required - 11_000.20).abs() < EPS);
                assert_eq!(available, 10_000.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(l.state().cash_balance(), 10_000.0);
        assert_eq!(l.state().position_units(), 0);
        assert!(l.state().history().is_empty());
    }

    #[test]
    fn buy_with_funds_debits_cost_and_fee() {
        let mut l = ledger(20_000.0);
        let entry = l.apply(&buy(), 1.10000, 4).unwrap().unwrap();
        assert!((l.state().cash_balance() - 8_999.80).abs() < EPS);
        assert_eq!(l.state().position_units(), 10_000);
        assert_eq!(entry.action, EntryAction::Buy);
        assert_eq!(entry.minute_index, 4);
        assert!((entry.fee - 0.20).abs() < EPS);
        assert!((entry.pnl + 0.20).abs() < EPS);
        assert_eq!(l.state().history().len(), 1);
    }

    #[test]
    fn sell_when_flat_is_rejected() {
        let mut l = ledger(20_000.0);
        assert_eq!(l.apply(&sell(), 1.1, 1), Err(LedgerError::NoPositionToClose));
        assert_eq!(l.state().cash_balance(), 20_000.0);
        assert!(l.state().history().is_empty());
    }

    #[test]
    fn pass_changes_nothing() {
        let mut l = ledger(20_000.0);
        assert_eq!(l.apply(&Decision::pass("quiet"), 1.1, 1), Ok(None));
        assert_eq!(l.state().cash_balance(), 20_000.0);
        assert!(l.state().history().is_empty());
    }

    #[test]
    fn round_trip_realizes_expected_pnl() {
        let mut l = ledger(20_000.0);
        l.apply(&buy(), 1.10000, 1).unwrap();
        let close = l.apply(&sell(), 1.11000, 2).unwrap().unwrap();

        // (p1 - p0) * size - fee_buy - fee_sell
        assert!((close.pnl - 99.60).abs() < EPS, "pnl {}", close.pnl);
        assert_eq!(close.action, EntryAction::CloseLong);
        assert_eq!(close.units, 10_000);
        assert!(close.rationale.contains("$99.60"));
        assert_eq!(l.state().position_units(), 0);
        assert!((l.state().cash_balance() - (20_000.0 + 99.60)).abs() < EPS);
        assert!((l.realized_pnl() - 99.60).abs() < EPS);
        assert_eq!(l.unrealized_pnl(1.2), 0.0);
        assert_eq!(l.state().history()[0].action, EntryAction::CloseLong);
    }

    #[test]
    fn open_cost_only_counts_current_lot() {
        let mut l = ledger(100_000.0);
        l.apply(&buy(), 1.10000, 1).unwrap();
        l.apply(&sell(), 1.10500, 2).unwrap();
        l.apply(&buy(), 1.09500, 3).unwrap();
        assert!((l.open_cost() - (10_950.0 + 0.20)).abs() < EPS);

        let close = l.apply(&sell(), 1.09600, 4).unwrap().unwrap();
        // second cycle judged on its own lot
        assert!((close.pnl - (10.0 - 0.40)).abs() < EPS, "pnl {}", close.pnl);
        assert!((l.realized_pnl() - (50.0 - 0.40 + 10.0 - 0.40)).abs() < EPS);
    }

    #[test]
    fn stacked_buys_close_in_full() {
        let mut l = ledger(100_000.0);
        l.apply(&buy(), 1.10000, 1).unwrap();
        l.apply(&buy(), 1.10200, 2).unwrap();
        assert_eq!(l.state().position_units(), 20_000);
        assert!((l.unrealized_pnl(1.10100) - (22_020.0 - 22_020.40)).abs() < EPS);

        let close = l.apply(&sell(), 1.10300, 3).unwrap().unwrap();
        assert_eq!(close.units, 20_000);
        assert!((close.fee - 0.40).abs() < EPS);
        assert!((close.pnl - (22_060.0 - 0.40 - 22_020.40)).abs() < EPS);
    }

    #[test]
    fn unrealized_and_total_pnl() {
        let mut l = ledger(20_000.0);
        l.apply(&buy(), 1.10000, 1).unwrap();
        assert!((l.unrealized_pnl(1.10100) - (11_010.0 - 11_000.20)).abs() < EPS);
        assert!((l.total_pnl(1.10100) - l.unrealized_pnl(1.10100)).abs() < EPS);
    }

    #[test]
    fn random_sequences_conserve_cash() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..50 {
            let mut l = ledger(rng.gen_range(0.0..60_000.0));
            for minute in 0..200u64 {
                let decision = match rng.gen_range(0..3) {
                    0 => buy(),
                    1 => sell(),
                    _ => Decision::pass("wait"),
                };
                let before = l.state().clone();
                let price = rng.gen_range(1.09..1.12);
                if l.apply(&decision, price, minute).is_err() {
                    assert_eq!(l.state().cash_balance(), before.cash_balance());
                    assert_eq!(l.state().position_units(), before.position_units());
                    assert_eq!(l.state().history().len(), before.history().len());
                }
                let pos = l.state().position_units();
                assert!(pos >= 0 && pos % l.config().trade_size == 0);
                assert!(l.state().cash_balance() >= -EPS);
                assert!((l.replay_cash() - l.state().cash_balance()).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn pnl_formatting() {
        assert_eq!(format_pnl(1234.567), "+$1,234.57");
        assert_eq!(format_pnl(-0.2), "-$0.20");
        assert_eq!(format_pnl(0.0), "$0.00");
        assert_eq!(format_pnl(-0.001), "$0.00");
        assert_eq!(format_pnl(99.6), "+$99.60");
        assert_eq!(format_price(1.1055), "1.10550");
    }
}
