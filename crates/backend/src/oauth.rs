//! OAuth broker: authorization URLs, code exchange, token refresh, and the
//! single choke point every adapter call goes through to obtain a valid
//! access token.
//!
//! Centralizing refresh here (with an optimistic guard on the stored token)
//! is what keeps two concurrent jobs for the same integration from both
//! refreshing and clobbering each other.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use diesel_async::AsyncPgConnection;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use shared_types::{Integration, Provider};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db;

type HmacSha256 = Hmac<Sha256>;

/// Callback rejects `state` tokens older than this.
pub const STATE_MAX_AGE_SECS: i64 = 600;

/// Tokens expiring within this margin are refreshed preemptively.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("provider {0} is not configured")]
    NotConfigured(Provider),

    #[error("invalid oauth state: {0}")]
    InvalidState(String),

    /// Non-2xx from the provider's token endpoint during code exchange.
    /// The caller must not create an Integration on this.
    #[error("code exchange failed: {0}")]
    ExchangeFailed(String),

    /// The provider rejected the refresh token, typically meaning the user
    /// revoked access. Not retried; surfaced as "please reconnect".
    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),

    /// Provider-side 5xx; retryable.
    #[error("provider unavailable: {0}")]
    Upstream(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Token tuple returned by exchange and refresh.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    /// Provider-side account/team id when the token response carries one
    /// (Slack team id, Dropbox account id).
    pub account_id: Option<String>,
}

impl TokenSet {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
    }
}

/// Decoded claims of an OAuth `state` token.
#[derive(Debug, Clone, PartialEq)]
pub struct StateClaims {
    pub owner_id: Uuid,
    pub provider: Provider,
    pub issued_at: DateTime<Utc>,
}

fn authorize_endpoint(provider: Provider) -> &'static str {
    match provider {
        Provider::Zoom => "https://zoom.us/oauth/authorize",
        Provider::Linear => "https://linear.app/oauth/authorize",
        Provider::Slack => "https://slack.com/oauth/v2/authorize",
        Provider::Dropbox => "https://www.dropbox.com/oauth2/authorize",
    }
}

fn token_endpoint(provider: Provider) -> &'static str {
    match provider {
        Provider::Zoom => "https://zoom.us/oauth/token",
        Provider::Linear => "https://api.linear.app/oauth/token",
        Provider::Slack => "https://slack.com/api/oauth.v2.access",
        Provider::Dropbox => "https://api.dropboxapi.com/oauth2/token",
    }
}

fn scopes(provider: Provider) -> &'static str {
    match provider {
        Provider::Zoom => "recording:read meeting:read user:read",
        Provider::Linear => "read",
        Provider::Slack => "channels:history,channels:read,team:read",
        Provider::Dropbox => "files.metadata.read account_info.read",
    }
}

/// Build the provider consent URL plus the opaque `state` that authenticates
/// the eventual callback.
pub fn build_authorization_url(
    config: &AppConfig,
    provider: Provider,
    owner_id: Uuid,
) -> Result<(String, String), OAuthError> {
    let creds = config
        .credentials(provider)
        .ok_or(OAuthError::NotConfigured(provider))?;

    let state = encode_state(&config.state_secret, owner_id, provider, Utc::now());
    let redirect_uri = config.oauth_redirect_uri();

    let mut url = format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
        authorize_endpoint(provider),
        urlencoding::encode(&creds.client_id),
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(scopes(provider)),
        urlencoding::encode(&state),
    );

    // Dropbox only issues refresh tokens for offline access.
    if provider == Provider::Dropbox {
        url.push_str("&token_access_type=offline");
    }

    Ok((url, state))
}

/// Encode `owner|provider|issued_at|nonce` with an HMAC-SHA256 trailer,
/// URL-safe base64 over the whole thing.
pub fn encode_state(
    secret: &str,
    owner_id: Uuid,
    provider: Provider,
    issued_at: DateTime<Utc>,
) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    let payload = format!(
        "{}|{}|{}|{}",
        owner_id,
        provider.as_str(),
        issued_at.timestamp(),
        nonce
    );
    let sig = sign_state(secret, &payload);
    URL_SAFE_NO_PAD.encode(format!("{}|{}", payload, sig))
}

/// Validate and decode a `state` token: signature, shape, and age window.
pub fn decode_state(
    secret: &str,
    state: &str,
    now: DateTime<Utc>,
) -> Result<StateClaims, OAuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state)
        .map_err(|_| OAuthError::InvalidState("not base64".to_string()))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|_| OAuthError::InvalidState("not utf-8".to_string()))?;

    let (payload, sig) = decoded
        .rsplit_once('|')
        .ok_or_else(|| OAuthError::InvalidState("missing signature".to_string()))?;

    let sig_bytes =
        hex::decode(sig).map_err(|_| OAuthError::InvalidState("bad signature".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| OAuthError::InvalidState("bad signature".to_string()))?;

    let parts: Vec<&str> = payload.split('|').collect();
    if parts.len() != 4 {
        return Err(OAuthError::InvalidState("malformed payload".to_string()));
    }

    let owner_id = parts[0]
        .parse::<Uuid>()
        .map_err(|_| OAuthError::InvalidState("bad owner id".to_string()))?;
    let provider = parts[1]
        .parse::<Provider>()
        .map_err(|_| OAuthError::InvalidState("bad provider".to_string()))?;
    let ts = parts[2]
        .parse::<i64>()
        .map_err(|_| OAuthError::InvalidState("bad timestamp".to_string()))?;
    let issued_at = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| OAuthError::InvalidState("bad timestamp".to_string()))?;

    let age = (now - issued_at).num_seconds();
    if age > STATE_MAX_AGE_SECS {
        return Err(OAuthError::InvalidState("state expired".to_string()));
    }
    // Small allowance for clock skew, nothing more.
    if age < -30 {
        return Err(OAuthError::InvalidState("state from the future".to_string()));
    }

    Ok(StateClaims {
        owner_id,
        provider,
        issued_at,
    })
}

fn sign_state(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Raw token-endpoint response, loose enough to cover all four providers.
/// Slack reports failures as 200 + `{"ok": false, "error": ...}`.
#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    account_id: Option<String>,
    team: Option<RawTeam>,
    ok: Option<bool>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTeam {
    id: Option<String>,
}

/// Exchange an authorization code for a token tuple.
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &AppConfig,
    provider: Provider,
    code: &str,
) -> Result<TokenSet, OAuthError> {
    let creds = config
        .credentials(provider)
        .ok_or(OAuthError::NotConfigured(provider))?;
    let redirect_uri = config.oauth_redirect_uri();

    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri),
    ];

    // Zoom wants client credentials as HTTP basic auth; the rest take form
    // parameters.
    let mut request = http.post(token_endpoint(provider));
    if provider == Provider::Zoom {
        request = request.basic_auth(&creds.client_id, Some(&creds.client_secret));
    } else {
        form.push(("client_id", creds.client_id.clone()));
        form.push(("client_secret", creds.client_secret.clone()));
    }

    let response = request.form(&form).send().await?;
    parse_token_response(provider, response, false).await
}

/// Refresh an expired access token.
pub async fn refresh(
    http: &reqwest::Client,
    config: &AppConfig,
    provider: Provider,
    refresh_token: &str,
) -> Result<TokenSet, OAuthError> {
    let creds = config
        .credentials(provider)
        .ok_or(OAuthError::NotConfigured(provider))?;

    let mut form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.to_string()),
    ];

    let mut request = http.post(token_endpoint(provider));
    if provider == Provider::Zoom {
        request = request.basic_auth(&creds.client_id, Some(&creds.client_secret));
    } else {
        form.push(("client_id", creds.client_id.clone()));
        form.push(("client_secret", creds.client_secret.clone()));
    }

    let response = request.form(&form).send().await?;
    parse_token_response(provider, response, true).await
}

async fn parse_token_response(
    provider: Provider,
    response: reqwest::Response,
    is_refresh: bool,
) -> Result<TokenSet, OAuthError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(OAuthError::Upstream(format!(
            "{} token endpoint returned {}",
            provider, status
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} returned {}: {}", provider, status, truncate(&body, 200));
        return if is_refresh {
            Err(OAuthError::RefreshRejected(detail))
        } else {
            Err(OAuthError::ExchangeFailed(detail))
        };
    }

    let raw: RawTokenResponse = response
        .json()
        .await
        .map_err(|e| OAuthError::ExchangeFailed(format!("undecodable token response: {}", e)))?;

    if raw.ok == Some(false) {
        let detail = format!(
            "{} rejected the request: {}",
            provider,
            raw.error.unwrap_or_else(|| "unknown".to_string())
        );
        return if is_refresh {
            Err(OAuthError::RefreshRejected(detail))
        } else {
            Err(OAuthError::ExchangeFailed(detail))
        };
    }

    let access_token = raw.access_token.ok_or_else(|| {
        OAuthError::ExchangeFailed(format!("{} response missing access_token", provider))
    })?;

    Ok(TokenSet {
        access_token,
        refresh_token: raw.refresh_token,
        expires_in: raw.expires_in,
        account_id: raw.account_id.or(raw.team.and_then(|t| t.id)),
    })
}

/// Whether a stored token can still be used without refreshing.
/// Tokens without an expiry (Linear, Slack bot tokens) never go stale here.
pub fn token_is_fresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => true,
        Some(exp) => exp - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > now,
    }
}

/// The single choke point for access tokens.
///
/// Returns the stored token while it is fresh; otherwise refreshes, persists
/// the new tuple under an optimistic guard, and returns whichever token won.
/// No other component may read `integration.access_token` directly.
pub async fn get_valid_access_token(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    integration: &Integration,
) -> Result<String, OAuthError> {
    if token_is_fresh(integration.token_expires_at, Utc::now()) {
        return Ok(integration.access_token.clone());
    }

    refresh_and_persist(http, config, conn, integration).await
}

/// Refresh the integration's token and write it back, regardless of the
/// stored expiry. Used both by the normal expiry path and by the runner's
/// one-shot recovery after an `AuthRejected`.
pub async fn refresh_and_persist(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    integration: &Integration,
) -> Result<String, OAuthError> {
    let provider = integration
        .provider()
        .map_err(|e| OAuthError::InvalidState(e))?;

    let refresh_token = integration.refresh_token.as_deref().ok_or_else(|| {
        OAuthError::RefreshRejected(format!(
            "{} integration has no refresh token",
            integration.provider
        ))
    })?;

    let tokens = refresh(http, config, provider, refresh_token).await?;

    // Providers do not always rotate the refresh token; keep the old one
    // when no replacement arrives.
    let next_refresh = tokens
        .refresh_token
        .as_deref()
        .or(integration.refresh_token.as_deref());

    let won = db::integrations::persist_tokens_if_unchanged(
        conn,
        integration.id,
        &integration.access_token,
        &tokens.access_token,
        next_refresh,
        tokens.expires_at(),
    )
    .await?;

    if won {
        return Ok(tokens.access_token);
    }

    // A concurrent refresh got there first; use the winner's token.
    tracing::debug!(
        integration_id = %integration.id,
        "lost token refresh race, re-reading stored token"
    );
    let current = db::integrations::get_by_id(conn, integration.id)
        .await?
        .ok_or_else(|| OAuthError::RefreshRejected("integration disappeared".to_string()))?;
    Ok(current.access_token)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-state-secret";

    #[test]
    fn state_round_trips() {
        let owner = Uuid::new_v4();
        let issued = Utc::now();
        let state = encode_state(SECRET, owner, Provider::Linear, issued);

        let claims = decode_state(SECRET, &state, Utc::now()).expect("state should decode");
        assert_eq!(claims.owner_id, owner);
        assert_eq!(claims.provider, Provider::Linear);
        assert_eq!(claims.issued_at.timestamp(), issued.timestamp());
    }

    #[test]
    fn stale_state_rejected() {
        let issued = Utc::now() - chrono::Duration::seconds(STATE_MAX_AGE_SECS + 5);
        let state = encode_state(SECRET, Uuid::new_v4(), Provider::Zoom, issued);

        let err = decode_state(SECRET, &state, Utc::now()).unwrap_err();
        assert!(matches!(err, OAuthError::InvalidState(msg) if msg.contains("expired")));
    }

    #[test]
    fn tampered_state_rejected() {
        let state = encode_state(SECRET, Uuid::new_v4(), Provider::Slack, Utc::now());
        let decoded = URL_SAFE_NO_PAD.decode(&state).unwrap();
        let mut text = String::from_utf8(decoded).unwrap();
        // Swap the provider segment without re-signing.
        text = text.replacen("slack", "zoom", 1);
        let forged = URL_SAFE_NO_PAD.encode(text);

        assert!(decode_state(SECRET, &forged, Utc::now()).is_err());
    }

    #[test]
    fn state_signed_with_other_secret_rejected() {
        let state = encode_state("other-secret", Uuid::new_v4(), Provider::Dropbox, Utc::now());
        assert!(decode_state(SECRET, &state, Utc::now()).is_err());
    }

    #[test]
    fn garbage_state_rejected() {
        assert!(decode_state(SECRET, "not-a-state", Utc::now()).is_err());
        assert!(decode_state(SECRET, "", Utc::now()).is_err());
    }

    #[test]
    fn token_freshness_margin() {
        let now = Utc::now();
        // No expiry: static API keys never need refresh.
        assert!(token_is_fresh(None, now));
        // Expiring in 30s is inside the 60s margin.
        assert!(!token_is_fresh(Some(now + chrono::Duration::seconds(30)), now));
        // Expiring in 5 minutes is fine.
        assert!(token_is_fresh(Some(now + chrono::Duration::seconds(300)), now));
        // Already expired.
        assert!(!token_is_fresh(Some(now - chrono::Duration::seconds(10)), now));
    }
}
