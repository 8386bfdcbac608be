//! Provider authentication
//!
//! The Airbus APIs take an API key only at their identity endpoint; every
//! order call needs a bearer token exchanged from it. [`TokenProvider`]
//! performs the exchange lazily and caches the token until shortly before
//! expiry, so concurrent callers share one token and one exchange.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// How long before nominal expiry a cached token is considered stale
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds
    expires_in: Option<i64>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges an API key for a bearer token and caches the result
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: Url,
    api_key: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Create a provider exchanging `api_key` at `token_url`
    pub fn new(http: reqwest::Client, token_url: Url, api_key: String) -> Self {
        Self {
            http,
            token_url,
            api_key,
            cached: Mutex::new(None),
        }
    }

    /// A valid bearer token, exchanged on first use or after expiry
    pub async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.expires_at {
                return Ok(token.token.clone());
            }
            debug!("cached bearer token expired, re-exchanging");
        }

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("apikey", self.api_key.as_str()),
                ("grant_type", "api_key"),
                ("client_id", "IDP"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // A definitive key rejection ends the run; anything else is an
            // identity-endpoint hiccup the poll loop can retry through
            return Err(
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    Error::Submission(format!("token exchange rejected with {status}: {body}"))
                } else {
                    Error::Fetch(format!("token exchange failed with {status}: {body}"))
                },
            );
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("token exchange returned malformed body: {e}")))?;

        let lifetime = token.expires_in.unwrap_or(3600);
        let expires_at =
            Utc::now() + ChronoDuration::seconds((lifetime - EXPIRY_MARGIN_SECS).max(0));
        let bearer = token.access_token.clone();
        *cached = Some(CachedToken {
            token: token.access_token,
            expires_at,
        });
        debug!(lifetime_secs = lifetime, "bearer token refreshed");
        Ok(bearer)
    }
}
