// ===============================
// src/bridge.rs (signal publish)
// ===============================
//
// Hands non-PASS decisions to whatever external consumer executes them. One slot per
// identity, last write wins: the consumer polls the slot and acts on NEW_SIGNAL.
//
// - HttpBridge   : PUT {base}/artifacts/{app_id}/signals/{identity}, optional HMAC header
// - MemoryBridge : in-process slots, used when no bridge URL is configured
//

use std::sync::Mutex;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Action, Decision};

pub const SIGNATURE_HEADER: &str = "X-Signal-Signature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecord {
    /// Unix millis.
    pub timestamp: i64,
    pub ticker: String,
    pub action: Action,
    pub price: f64,
    pub trade_size: i64,
    pub rationale: String,
    pub status: String,
}

impl SignalRecord {
    /// `None` for PASS: those are never published.
    pub fn from_decision(decision: &Decision, ticker: &str, price: f64, trade_size: i64) -> Option<Self> {
        if decision.action == Action::Pass {
            return None;
        }
        Some(Self {
            timestamp: Utc::now().timestamp_millis(),
            ticker: ticker.to_string(),
            action: decision.action,
            price,
            trade_size,
            rationale: decision.rationale.clone(),
            status: "NEW_SIGNAL".to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bridge request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bridge rejected write: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("signal encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SignalPublisher: Send + Sync {
    async fn publish(&self, signal: &SignalRecord, identity: &str) -> Result<(), PublishError>;
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct HttpBridge {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    secret: Option<String>,
}

impl HttpBridge {
    pub fn new(base_url: &str, app_id: &str, secret: Option<String>, request_timeout: Duration) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            secret,
        })
    }

    fn slot_url(&self, identity: &str) -> String {
        format!(
            "{}/artifacts/{}/signals/{}",
            self.base_url,
            urlencoding::encode(&self.app_id),
            urlencoding::encode(identity)
        )
    }
}

#[async_trait]
impl SignalPublisher for HttpBridge {
    async fn publish(&self, signal: &SignalRecord, identity: &str) -> Result<(), PublishError> {
        let body = serde_json::to_vec(signal)?;
        let mut req = self
            .http
            .put(self.slot_url(identity))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, sign_body(secret, &body));
        }

        let rsp = req.body(body).send().await?;
        if rsp.status().is_success() {
            info!(action = %signal.action, price = signal.price, %identity, "signal written to bridge");
            Ok(())
        } else {
            let status = rsp.status().as_u16();
            let body = rsp.text().await.unwrap_or_default();
            Err(PublishError::Rejected { status, body })
        }
    }
}

#[derive(Default)]
pub struct MemoryBridge {
    slots: Mutex<HashMap<String, SignalRecord>>,
}

impl MemoryBridge {
    pub fn new() -> Self { Self::default() }

    pub fn latest(&self, identity: &str) -> Option<SignalRecord> {
        self.slots.lock().ok()?.get(identity).cloned()
    }

    pub fn len(&self) -> usize { self.slots.lock().map(|s| s.len()).unwrap_or(0) }
}

#[async_trait]
impl SignalPublisher for MemoryBridge {
    async fn publish(&self, signal: &SignalRecord, identity: &str) -> Result<(), PublishError> {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(identity.to_string(), signal.clone());
        }
        debug!(action = %signal.action, %identity, "signal stored in memory bridge");
        Ok(())
    }
}
