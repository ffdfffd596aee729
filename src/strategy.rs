// ===============================
// src/strategy.rs
// ===============================
//
// Decision sources. Both variants answer the same question: given this minute's
// snapshot and the current long position, BUY, SELL or PASS?
//
// 1) ThresholdPolicy  -> RSI mean-reversion rule, pure and local
// 2) AdvisoryPolicy   -> remote decision service (see advisory.rs)
//
// A policy never fails: anything that goes wrong inside it comes back as PASS.
//

use async_trait::async_trait;

use crate::domain::{Action, Decision, MarketSnapshot};

#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn decide(&self, snapshot: &MarketSnapshot, position_units: i64) -> Decision;
}

// -----------------------------------------------------------------------------
// RSI threshold
//    BUY  when rsi < oversold  and flat
//    SELL when rsi > overbought and long
//    otherwise PASS
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    oversold: f64,
    overbought: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self { Self { oversold: 30.0, overbought: 70.0 } }
}

impl ThresholdPolicy {
    pub fn on_snapshot(&self, snapshot: &MarketSnapshot, position_units: i64) -> Decision {
        let rsi = snapshot.rsi;
        if rsi < self.oversold && position_units == 0 {
            return Decision::new(Action::Buy, format!("RSI {:.2} below {}", rsi, self.oversold));
        }
        if rsi > self.overbought && position_units > 0 {
            return Decision::new(Action::Sell, format!("RSI {:.2} above {}", rsi, self.overbought));
        }
        Decision::pass(format!("No strong signal (RSI {:.2})", rsi))
    }
}

#[async_trait]
impl DecisionPolicy for ThresholdPolicy {
    fn name(&self) -> &'static str { "threshold" }

    async fn decide(&self, snapshot: &MarketSnapshot, position_units: i64) -> Decision {
        self.on_snapshot(snapshot, position_units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{MarketSynthesizer, PriceBand, INITIAL_PRICE};

    fn snap_with_rsi(rsi: f64) -> MarketSnapshot {
        let mut synth = MarketSynthesizer::with_seed(1, PriceBand::default());
        MarketSnapshot { rsi, ..synth.seed(INITIAL_PRICE) }
    }

    #[tokio::test]
    async fn oversold_and_flat_buys() {
        let d = ThresholdPolicy::default().decide(&snap_with_rsi(25.0), 0).await;
        assert_eq!(d.action, Action::Buy);
        assert!(d.rationale.contains("below 30"), "{}", d.rationale);
    }

    #[test]
    fn oversold_while_long_passes() {
        let d = ThresholdPolicy::default().on_snapshot(&snap_with_rsi(25.0), 10_000);
        assert_eq!(d.action, Action::Pass);
    }

    #[test]
    fn overbought_and_long_sells() {
        let d = ThresholdPolicy::default().on_snapshot(&snap_with_rsi(72.5), 10_000);
        assert_eq!(d.action, Action::Sell);
        assert!(d.rationale.contains("above 70"));
    }

    #[test]
    fn overbought_while_flat_passes() {
        let d = ThresholdPolicy::default().on_snapshot(&snap_with_rsi(75.0), 0);
        assert_eq!(d, Decision::pass("No strong signal (RSI 75.00)"));
    }

    #[test]
    fn boundaries_are_exclusive() {
        let p = ThresholdPolicy::default();
        assert_eq!(p.on_snapshot(&snap_with_rsi(30.0), 0).action, Action::Pass);
        assert_eq!(p.on_snapshot(&snap_with_rsi(70.0), 10_000).action, Action::Pass);
    }
}
