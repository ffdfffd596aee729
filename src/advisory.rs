// ===============================
// src/advisory.rs
// ===============================
//
// Remote decision source. POSTs the minute's market view as JSON and expects
//   {"action": "BUY" | "SELL" | "PASS", "rationale": "..."}
// back, optionally wrapped in ```json fences.
//
// Failure never leaves this module: transport errors, non-2xx, bad bodies and the
// overall timeout all turn into PASS with an "Advisory Error: ..." rationale.
// HTTP 429 is retried with exponential backoff + jitter up to `max_attempts`.
//

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::domain::{Action, Decision, MarketSnapshot, PriceLevel};
use crate::metrics::ADVISORY_FALLBACKS;
use crate::strategy::DecisionPolicy;

const INSTRUCTIONS: &str = "Reply with a single JSON object {action, rationale}. \
BUY: enter or add to the long position. SELL: exit the current long position. \
PASS: take no action. Rationale: one concise sentence.";

#[derive(Debug, Clone)]
pub struct AdvisoryConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub ticker: String,
    /// Bounds the whole call, retries included.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("malformed response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl AdvisoryError {
    fn label(&self) -> &'static str {
        match self {
            AdvisoryError::Transport(_) => "transport",
            AdvisoryError::Status(s) if *s == StatusCode::TOO_MANY_REQUESTS => "rate_limited",
            AdvisoryError::Status(_) => "status",
            AdvisoryError::Parse(_) => "parse",
            AdvisoryError::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdvisoryRequest<'a> {
    ticker: &'a str,
    price: f64,
    rsi: f64,
    volume: i64,
    top_bid: PriceLevel,
    top_ask: PriceLevel,
    position_units: i64,
    instructions: &'static str,
}

#[derive(Debug, Deserialize)]
struct AdvisoryReply {
    action: Action,
    rationale: String,
}

pub struct AdvisoryPolicy {
    http: reqwest::Client,
    cfg: AdvisoryConfig,
}

impl AdvisoryPolicy {
    pub fn new(cfg: AdvisoryConfig) -> Result<Self, AdvisoryError> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    async fn request(&self, body: &AdvisoryRequest<'_>) -> Result<Decision, AdvisoryError> {
        let mut attempt: u32 = 0;
        loop {
            let mut req = self.http.post(&self.cfg.url).json(body);
            if let Some(key) = &self.cfg.api_key {
                req = req.bearer_auth(key);
            }
            let rsp = req.send().await?;
            let status = rsp.status();

            if status == StatusCode::TOO_MANY_REQUESTS && attempt + 1 < self.cfg.max_attempts {
                let delay = backoff_delay(self.cfg.backoff_base, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "advisory rate limited, retrying");
                sleep(delay).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(AdvisoryError::Status(status));
            }

            let text = rsp.text().await?;
            return parse_reply(&text);
        }
    }
}

#[async_trait]
impl DecisionPolicy for AdvisoryPolicy {
    fn name(&self) -> &'static str { "advisory" }

    async fn decide(&self, snapshot: &MarketSnapshot, position_units: i64) -> Decision {
        let body = AdvisoryRequest {
            ticker: &self.cfg.ticker,
            price: snapshot.price,
            rsi: snapshot.rsi,
            volume: snapshot.daily_volume,
            top_bid: snapshot.order_book.best_bid(),
            top_ask: snapshot.order_book.best_ask(),
            position_units,
            instructions: INSTRUCTIONS,
        };

        let outcome = match timeout(self.cfg.timeout, self.request(&body)).await {
            Ok(res) => res,
            Err(_) => Err(AdvisoryError::Timeout(self.cfg.timeout)),
        };

        match outcome {
            Ok(decision) => {
                debug!(action = %decision.action, rationale = %decision.rationale, "advisory decision");
                decision
            }
            Err(e) => {
                warn!(error = %e, "advisory source unavailable, falling back to PASS");
                ADVISORY_FALLBACKS.with_label_values(&[e.label()]).inc();
                Decision::pass(format!("Advisory Error: {e}"))
            }
        }
    }
}

/// base * 2^attempt plus up to one base of jitter
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let factor = 1u64 << attempt.min(6);
    let jitter = if base_ms > 0 { rand::thread_rng().gen_range(0..base_ms) } else { 0 };
    Duration::from_millis(base_ms.saturating_mul(factor) + jitter)
}

fn parse_reply(text: &str) -> Result<Decision, AdvisoryError> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let reply: AdvisoryReply = serde_json::from_str(cleaned.trim())?;
    Ok(Decision::new(reply.action, reply.rationale))
}
