// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : fx_sim_bot: simulated single-instrument FX trading loop in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Synthesizes one minute of EUR/USD-style market data per tick, asks a
          decision policy (RSI threshold or remote advisory service) for
          BUY/SELL/PASS, publishes signals to a bridge for an external consumer,
          and books the decision into a long-only cash/position ledger.
=============================================================================
*/
use std::env;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;
use url::Url;

use crate::advisory::AdvisoryConfig;
use crate::feed::{PriceBand, INITIAL_PRICE};
use crate::identity::IdentityConfig;
use crate::ledger::LedgerConfig;

/// Which decision source drives the loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyMode {
    Threshold,
    Advisory,
}

impl PolicyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threshold" | "rsi" | "rule" => Some(PolicyMode::Threshold),
            "advisory" | "remote" | "ai" => Some(PolicyMode::Advisory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Threshold => "threshold",
            PolicyMode::Advisory => "advisory",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Command-line overrides (take precedence over env / .env)
#[derive(Parser, Debug, Default)]
#[command(name = "fx_sim_bot", about = "Simulated FX trading loop")]
pub struct Cli {
    /// threshold | advisory
    #[arg(long)]
    pub policy: Option<String>,
    /// Tick interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,
    /// Stop after this many ticks
    #[arg(long)]
    pub ticks: Option<u64>,
    /// Seed for the market synthesizer
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub starting_cash: Option<f64>,
    #[arg(long)]
    pub record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// None -> in-memory bridge
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbol: String,
    pub ledger: LedgerConfig,
    pub tick_interval: Duration,
    pub band: PriceBand,
    pub initial_price: f64,
    pub seed: Option<u64>,
    pub max_ticks: Option<u64>,

    pub policy: PolicyMode,
    pub advisory: Option<AdvisoryConfig>,
    pub bridge: BridgeConfig,
    pub identity: IdentityConfig,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub heartbeat: Duration,
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match get(key) {
        Some(v) if !v.trim().is_empty() => v.trim().parse().map_err(|_| ConfigError::Parse { key, value: v }),
        _ => Ok(default),
    }
}

fn non_empty(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn check_url(key: &str, raw: &str) -> Result<(), ConfigError> {
    Url::parse(raw).map(|_| ()).map_err(|e| ConfigError::Invalid(format!("{key}: bad url {raw:?} ({e})")))
}

/// Build the config from a key lookup (env in production, a map in tests).
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    // ===== Instrument & ledger =====
    let symbol = non_empty(&get, "SYMBOL").unwrap_or_else(|| "EUR/USD".to_string());
    let ledger = LedgerConfig {
        starting_cash: parsed(&get, "STARTING_CASH", 10_000.0)?,
        trade_size: parsed(&get, "TRADE_SIZE", 10_000)?,
        fee_rate: parsed(&get, "FEE_RATE", 0.00002)?,
    };
    let band = PriceBand {
        min: parsed(&get, "PRICE_MIN", PriceBand::default().min)?,
        max: parsed(&get, "PRICE_MAX", PriceBand::default().max)?,
    };
    let initial_price = parsed(&get, "INITIAL_PRICE", INITIAL_PRICE)?;
    let tick_interval = Duration::from_millis(parsed(&get, "TICK_INTERVAL_MS", 3_000u64)?);

    let seed = match non_empty(&get, "SEED") {
        Some(_) => Some(parsed(&get, "SEED", 0u64)?),
        None => None,
    };
    let max_ticks = match non_empty(&get, "MAX_TICKS") {
        Some(_) => Some(parsed(&get, "MAX_TICKS", 0u64)?),
        None => None,
    };

    // ===== Policy =====
    let policy = match non_empty(&get, "POLICY") {
        Some(raw) => PolicyMode::parse_one(&raw).ok_or(ConfigError::Parse { key: "POLICY", value: raw })?,
        None => PolicyMode::Threshold,
    };
    let advisory = match non_empty(&get, "ADVISORY_URL") {
        Some(url) => Some(AdvisoryConfig {
            url,
            api_key: non_empty(&get, "ADVISORY_API_KEY"),
            ticker: symbol.clone(),
            timeout: Duration::from_millis(parsed(&get, "ADVISORY_TIMEOUT_MS", 8_000u64)?),
            max_attempts: parsed(&get, "ADVISORY_MAX_ATTEMPTS", 3u32)?,
            backoff_base: Duration::from_millis(parsed(&get, "ADVISORY_BACKOFF_MS", 1_000u64)?),
        }),
        None => None,
    };

    // ===== Bridge & identity =====
    let bridge = BridgeConfig {
        url: non_empty(&get, "BRIDGE_URL"),
        secret: non_empty(&get, "BRIDGE_SECRET"),
        timeout: Duration::from_millis(parsed(&get, "BRIDGE_TIMEOUT_MS", 5_000u64)?),
    };
    let identity = IdentityConfig {
        app_id: non_empty(&get, "APP_ID").unwrap_or_else(|| "local-app-id".to_string()),
        identity: non_empty(&get, "IDENTITY"),
        auth_url: non_empty(&get, "AUTH_URL"),
        auth_token: non_empty(&get, "AUTH_TOKEN"),
    };

    let args = Args {
        symbol,
        ledger,
        tick_interval,
        band,
        initial_price,
        seed,
        max_ticks,
        policy,
        advisory,
        bridge,
        identity,
        record_file: non_empty(&get, "RECORD_FILE"),
        metrics_port: parsed(&get, "METRICS_PORT", 9898u16)?,
        heartbeat: Duration::from_secs(parsed(&get, "HEARTBEAT_SECS", 10u64)?.max(1)),
    };
    Ok(args)
}

impl Args {
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(p) = &cli.policy {
            self.policy = PolicyMode::parse_one(p).ok_or(ConfigError::Parse { key: "--policy", value: p.clone() })?;
        }
        if let Some(ms) = cli.interval_ms {
            self.tick_interval = Duration::from_millis(ms);
        }
        if cli.ticks.is_some() {
            self.max_ticks = cli.ticks;
        }
        if cli.seed.is_some() {
            self.seed = cli.seed;
        }
        if let Some(cash) = cli.starting_cash {
            self.ledger.starting_cash = cash;
        }
        if cli.record_file.is_some() {
            self.record_file = cli.record_file.clone();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.band.min < self.band.max) {
            return Err(ConfigError::Invalid(format!("price band [{}, {}] is empty", self.band.min, self.band.max)));
        }
        if !self.band.contains(self.initial_price) {
            return Err(ConfigError::Invalid(format!("INITIAL_PRICE {} outside price band", self.initial_price)));
        }
        if self.ledger.trade_size <= 0 {
            return Err(ConfigError::Invalid("TRADE_SIZE must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.ledger.fee_rate) {
            return Err(ConfigError::Invalid("FEE_RATE must be in [0, 1)".into()));
        }
        if self.ledger.starting_cash < 0.0 {
            return Err(ConfigError::Invalid("STARTING_CASH must not be negative".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick interval must be positive".into()));
        }
        match (&self.policy, &self.advisory) {
            (PolicyMode::Advisory, None) => {
                return Err(ConfigError::Invalid("POLICY=advisory requires ADVISORY_URL".into()));
            }
            (_, Some(adv)) => {
                check_url("ADVISORY_URL", &adv.url)?;
                if adv.max_attempts == 0 {
                    return Err(ConfigError::Invalid("ADVISORY_MAX_ATTEMPTS must be at least 1".into()));
                }
            }
            _ => {}
        }
        if let Some(u) = &self.bridge.url {
            check_url("BRIDGE_URL", u)?;
        }
        if let Some(u) = &self.identity.auth_url {
            check_url("AUTH_URL", u)?;
        }
        Ok(())
    }
}

pub fn load() -> Result<Args, ConfigError> {
    // .env first so the lookup below sees it
    let _ = dotenv();
    let mut args = from_lookup(|k| env::var(k).ok())?;
    args.apply_cli(&Cli::parse())?;
    args.validate()?;
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_reference_setup() {
        let args = from_lookup(lookup(&[])).unwrap();
        assert_eq!(args.symbol, "EUR/USD");
        assert_eq!(args.ledger.trade_size, 10_000);
        assert_eq!(args.ledger.fee_rate, 0.00002);
        assert_eq!(args.ledger.starting_cash, 10_000.0);
        assert_eq!(args.tick_interval, Duration::from_secs(3));
        assert_eq!(args.band, PriceBand { min: 1.09, max: 1.12 });
        assert_eq!(args.policy, PolicyMode::Threshold);
        assert!(args.advisory.is_none());
        assert!(args.bridge.url.is_none());
        assert_eq!(args.identity.app_id, "local-app-id");
        assert!(args.validate().is_ok());
    }

    #[test]
    fn advisory_settings_are_read() {
        let args = from_lookup(lookup(&[
            ("POLICY", "advisory"),
            ("ADVISORY_URL", "http://localhost:8080/decide"),
            ("ADVISORY_TIMEOUT_MS", "1500"),
            ("SYMBOL", "GBP/USD"),
        ]))
        .unwrap();
        assert_eq!(args.policy, PolicyMode::Advisory);
        let adv = args.advisory.as_ref().unwrap();
        assert_eq!(adv.timeout, Duration::from_millis(1500));
        assert_eq!(adv.ticker, "GBP/USD");
        assert_eq!(adv.max_attempts, 3);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn advisory_without_url_is_rejected() {
        let args = from_lookup(lookup(&[("POLICY", "advisory")])).unwrap();
        assert!(matches!(args.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_numbers_are_reported_with_key() {
        let err = from_lookup(lookup(&[("TRADE_SIZE", "ten")])).unwrap_err();
        assert_eq!(err, ConfigError::Parse { key: "TRADE_SIZE", value: "ten".into() });
    }

    #[test]
    fn inverted_band_is_rejected() {
        let args = from_lookup(lookup(&[("PRICE_MIN", "1.2"), ("PRICE_MAX", "1.1")])).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn cli_overrides_env() {
        let mut args = from_lookup(lookup(&[("TICK_INTERVAL_MS", "500")])).unwrap();
        let cli = Cli::parse_from(["fx_sim_bot", "--interval-ms", "50", "--ticks", "7", "--seed", "9", "--starting-cash", "20000"]);
        args.apply_cli(&cli).unwrap();
        assert_eq!(args.tick_interval, Duration::from_millis(50));
        assert_eq!(args.max_ticks, Some(7));
        assert_eq!(args.seed, Some(9));
        assert_eq!(args.ledger.starting_cash, 20_000.0);
    }

    #[test]
    fn bad_bridge_url_is_rejected() {
        let args = from_lookup(lookup(&[("BRIDGE_URL", "not a url")])).unwrap();
        assert!(args.validate().is_err());
    }
}
