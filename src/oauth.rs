use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::error;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{LeaderboardError, Result};

pub const DEFAULT_AUTH_URL: &str = "https://openrouter.ai/auth";
pub const DEFAULT_KEYS_URL: &str = "https://openrouter.ai/api/v1/auth/keys";
/// The only challenge method this client advertises.
pub const CHALLENGE_METHOD: &str = "S256";

/// A PKCE verifier and its derived challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);
        Pkce { verifier, challenge }
    }
}

/// 32 random bytes, base64url without padding (43 characters).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url (no padding) of SHA-256 over the verifier's string bytes.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Authorization URL the browser is redirected to.
///
/// # Arguments
/// * `auth_url` - Provider authorization endpoint
/// * `callback_url` - Where the provider sends the user back with `?code=`
/// * `challenge` - PKCE challenge for the verifier held in the cookie
pub fn authorization_url(auth_url: &str, callback_url: &str, challenge: &str) -> String {
    format!(
        "{}?callback_url={}&code_challenge={}&code_challenge_method={}",
        auth_url,
        urlencoding::encode(callback_url),
        urlencoding::encode(challenge),
        CHALLENGE_METHOD
    )
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    code_verifier: &'a str,
    code_challenge_method: &'static str,
}

/// Key returned by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangedKey {
    pub key: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Authorization-code exchange against the provider's key endpoint.
pub struct OAuthClient {
    http: reqwest::Client,
    auth_url: String,
    keys_url: String,
}

impl OAuthClient {
    pub fn new(auth_url: impl Into<String>, keys_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(OAuthClient {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            auth_url: auth_url.into(),
            keys_url: keys_url.into(),
        })
    }

    pub fn authorization_url(&self, callback_url: &str, challenge: &str) -> String {
        authorization_url(&self.auth_url, callback_url, challenge)
    }

    /// Trade an authorization code for an API key. Never retried.
    ///
    /// # Errors
    /// * `OAuthExchange { status, body }` for any non-success response
    /// * `UpstreamFetch` when the endpoint is unreachable or replies with garbage
    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<ExchangedKey> {
        let resp = self
            .http
            .post(&self.keys_url)
            .json(&ExchangeRequest {
                code,
                code_verifier: verifier,
                code_challenge_method: CHALLENGE_METHOD,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("OAuth exchange failed ({}): {}", status, body);
            return Err(LeaderboardError::OAuthExchange {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<ExchangedKey>().await?)
    }
}
