// ===============================
// src/identity.rs
// ===============================
//
// Resolves the caller identity used as the signal-bridge key. The value shows up on a
// watch channel some time after startup; until then it is `None` and the pipeline
// simply skips publishing.
//
// Resolution order:
//   1) IDENTITY set           -> used as-is
//   2) AUTH_URL set           -> POST {appId, token}, read {uid}
//                                (failure -> "auth-failed-<hex>")
//   3) nothing configured     -> "local-<appId>"
//

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub app_id: String,
    pub identity: Option<String>,
    pub auth_url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("auth request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("auth service answered HTTP {0}")]
    Status(u16),
    #[error("auth response carried an empty uid")]
    EmptyUid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    app_id: &'a str,
    token: Option<&'a str>,
}

#[derive(Deserialize)]
struct AuthReply {
    uid: String,
}

async fn sign_in(http: &reqwest::Client, url: &str, cfg: &IdentityConfig) -> Result<String, IdentityError> {
    let body = AuthRequest { app_id: &cfg.app_id, token: cfg.auth_token.as_deref() };
    let rsp = http.post(url).json(&body).send().await?;
    if !rsp.status().is_success() {
        return Err(IdentityError::Status(rsp.status().as_u16()));
    }
    let reply = rsp.json::<AuthReply>().await?;
    if reply.uid.trim().is_empty() {
        return Err(IdentityError::EmptyUid);
    }
    Ok(reply.uid)
}

fn fallback_identity() -> String {
    format!("auth-failed-{:016x}", rand::thread_rng().gen::<u64>())
}

pub async fn resolve(http: &reqwest::Client, cfg: &IdentityConfig) -> String {
    if let Some(id) = cfg.identity.as_ref().filter(|s| !s.trim().is_empty()) {
        return id.clone();
    }
    match &cfg.auth_url {
        Some(url) => match sign_in(http, url, cfg).await {
            Ok(uid) => uid,
            Err(e) => {
                warn!(error = %e, "identity bootstrap failed, using fallback id");
                fallback_identity()
            }
        },
        None => format!("local-{}", cfg.app_id),
    }
}

/// Start resolution in the background and return the channel it lands on.
pub fn spawn(cfg: IdentityConfig, http: reqwest::Client) -> watch::Receiver<Option<String>> {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let id = resolve(&http, &cfg).await;
        info!(identity = %id, "identity ready");
        tx.send_replace(Some(id));
        // keep the sender alive so receivers never observe a closed channel
        tx.closed().await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn cfg() -> IdentityConfig {
        IdentityConfig { app_id: "app-1".to_string(), ..IdentityConfig::default() }
    }

    #[tokio::test]
    async fn explicit_identity_wins() {
        let c = IdentityConfig { identity: Some("ea-77".into()), auth_url: Some("http://127.0.0.1:1".into()), ..cfg() };
        assert_eq!(resolve(&reqwest::Client::new(), &c).await, "ea-77");
    }

    #[tokio::test]
    async fn unconfigured_is_local() {
        assert_eq!(resolve(&reqwest::Client::new(), &cfg()).await, "local-app-1");
    }

    #[tokio::test]
    async fn auth_service_uid_is_used() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth")
            .match_body(Matcher::PartialJsonString(r#"{"appId":"app-1","token":"tok"}"#.to_string()))
            .with_status(200)
            .with_body(r#"{"uid":"u-123"}"#)
            .create_async()
            .await;

        let c = IdentityConfig { auth_url: Some(format!("{}/auth", server.url())), auth_token: Some("tok".into()), ..cfg() };
        assert_eq!(resolve(&reqwest::Client::new(), &c).await, "u-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn auth_failure_falls_back() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/auth").with_status(401).create_async().await;

        let c = IdentityConfig { auth_url: Some(format!("{}/auth", server.url())), ..cfg() };
        let id = resolve(&reqwest::Client::new(), &c).await;
        assert!(id.starts_with("auth-failed-"), "{id}");
        assert_eq!(id.len(), "auth-failed-".len() + 16);
    }

    #[tokio::test]
    async fn spawned_bootstrap_becomes_available() {
        let mut rx = spawn(IdentityConfig { identity: Some("ea-1".into()), ..cfg() }, reqwest::Client::new());
        while rx.borrow().is_none() {
            rx.changed().await.unwrap();
        }
        assert_eq!(rx.borrow().as_deref(), Some("ea-1"));
    }
}
