//! Machine-to-machine token cache.
//!
//! One bearer token per process, fetched by client credentials and refreshed lazily shortly
//! before the JWT `exp` claim. Readers always observe a complete token value (the cache sits
//! behind an async `RwLock`).

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use bridge_core::{Error, Result};

/// Refresh this long before the token actually expires.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Clone)]
pub struct AuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audience", &self.audience)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_SLACK_SECS) > now
    }
}

pub struct TokenCache {
    cfg: AuthConfig,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// The only claim we care about. We consume the token, we do not verify it, so the signature
/// check is disabled when reading `exp`.
#[derive(Debug, Deserialize)]
struct ExpClaim {
    exp: i64,
}

impl TokenCache {
    pub fn new(cfg: AuthConfig, http: reqwest::Client) -> Self {
        Self {
            cfg,
            http,
            cached: RwLock::new(None),
        }
    }

    /// Current bearer token, fetching or refreshing as needed.
    pub async fn bearer(&self) -> Result<String> {
        let now = Utc::now();
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.bearer.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(token) = slot.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.bearer.clone());
            }
        }

        let token = self.fetch().await?;
        let bearer = token.bearer.clone();
        *slot = Some(token);
        Ok(bearer)
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let resp = self
            .http
            .post(&self.cfg.token_url)
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.cfg.client_id,
                "client_secret": self.cfg.client_secret,
                "audience": self.cfg.audience,
            }))
            .send()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("POST token endpoint: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::external(anyhow::anyhow!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode token response: {err}")))?;

        let expires_at = token_expiry(&body, Utc::now());
        tracing::debug!(
            event = "bridge.contest.token.refreshed",
            expires_at = %expires_at,
            "machine token refreshed"
        );

        Ok(CachedToken {
            bearer: body.access_token,
            expires_at,
        })
    }
}

fn token_expiry(body: &TokenResponse, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(exp) = decode_exp(&body.access_token) {
        return exp;
    }
    // Opaque token: trust expires_in, defaulting to a conservative ten minutes.
    now + chrono::Duration::seconds(body.expires_in.unwrap_or(600))
}

fn decode_exp(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let data = decode::<ExpClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    Utc.timestamp_opt(data.claims.exp, 0).single()
}
