// ===============================
// src/feed.rs
// ===============================
//
// Synthetic market data, one snapshot per simulated minute:
// - price      : bounded random drift, clamped to the configured band
// - rsi        : small random walk pushed by the sign of the price move, [20, 80]
// - volume     : previous volume plus a bounded random delta
// - order book : rebuilt around the new price each minute
//
// Prices are stored at 5 dp and RSI at 2 dp so that logs and comparisons are stable.
//

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{round_dp, MarketSnapshot, OrderBook, PriceLevel};

pub const INITIAL_PRICE: f64 = 1.10550;
pub const INITIAL_RSI: f64 = 50.0;
pub const INITIAL_DAILY_VOLUME: i64 = 500_000_000;

const BASE_SPREAD: f64 = 0.00015;
const SPREAD_JITTER: f64 = 0.000025;
const BASE_VOLUME: f64 = 500_000.0;
const MAX_DRIFT: f64 = 0.00015;
const MAX_RSI_STEP: f64 = 2.0;
const LEVEL_STEP: f64 = 0.00005;
const RSI_MIN: f64 = 20.0;
const RSI_MAX: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBand { pub min: f64, pub max: f64 }

impl Default for PriceBand {
    fn default() -> Self { Self { min: 1.09000, max: 1.12000 } }
}

impl PriceBand {
    pub fn clamp(&self, px: f64) -> f64 { px.clamp(self.min, self.max) }
    pub fn contains(&self, px: f64) -> bool { px >= self.min && px <= self.max }
}

pub struct MarketSynthesizer {
    band: PriceBand,
    rng: StdRng,
}

impl MarketSynthesizer {
    pub fn new(band: PriceBand) -> Self {
        Self { band, rng: StdRng::from_entropy() }
    }

    /// Reproducible stream for tests and `--seed` runs.
    pub fn with_seed(seed: u64, band: PriceBand) -> Self {
        Self { band, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn band(&self) -> PriceBand { self.band }

    /// Minute 0 at a fixed price and neutral RSI.
    pub fn seed(&mut self, initial_price: f64) -> MarketSnapshot {
        let price = round_dp(self.band.clamp(initial_price), 5);
        MarketSnapshot {
            price,
            rsi: INITIAL_RSI,
            daily_volume: INITIAL_DAILY_VOLUME,
            minute_index: 0,
            order_book: self.order_book(price),
        }
    }

    pub fn next(&mut self, prev: &MarketSnapshot) -> MarketSnapshot {
        let drift = (self.rng.gen::<f64>() - 0.5) * MAX_DRIFT;
        let price = round_dp(self.band.clamp(prev.price + drift), 5);

        // a flat minute counts as a down move
        let direction = if price > prev.price { 1.0 } else { -1.0 };
        let step = direction * self.rng.gen::<f64>() * MAX_RSI_STEP;
        let rsi = round_dp((prev.rsi + step).clamp(RSI_MIN, RSI_MAX), 2);

        let vol_delta = self.rng.gen_range(0..500_000i64) - 200_000;
        let daily_volume = (prev.daily_volume + vol_delta).max(0);

        MarketSnapshot {
            price,
            rsi,
            daily_volume,
            minute_index: prev.minute_index + 1,
            order_book: self.order_book(price),
        }
    }

    /// Three levels a side around `price`. The volume factor shifts size between the
    /// touch bid and touch ask in opposite directions.
    fn order_book(&mut self, price: f64) -> OrderBook {
        let spread = BASE_SPREAD + self.rng.gen_range(-SPREAD_JITTER..SPREAD_JITTER);
        let bid = price - spread / 2.0;
        let ask = price + spread / 2.0;
        let vf: f64 = self.rng.gen_range(0.8..1.2);

        let level = |px: f64, size: f64| PriceLevel { price: round_dp(px, 5), size: size.floor() as i64 };

        OrderBook {
            bids: [
                level(bid, BASE_VOLUME * vf * 1.5),
                level(bid - LEVEL_STEP, BASE_VOLUME * 1.2),
                level(bid - 2.0 * LEVEL_STEP, BASE_VOLUME * 0.8),
            ],
            asks: [
                level(ask, BASE_VOLUME * (2.0 - vf) * 1.5),
                level(ask + LEVEL_STEP, BASE_VOLUME * 1.1),
                level(ask + 2.0 * LEVEL_STEP, BASE_VOLUME * 0.7),
            ],
        }
    }
}
