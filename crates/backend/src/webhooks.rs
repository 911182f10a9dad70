//! Webhook ingress: signature verification and enqueueing.
//!
//! The handler does no provider API calls and no entity writes; a verified
//! delivery is stored verbatim as a `webhook_event` job and replayed by the
//! runner. Only the handshake challenges (Slack URL verification, Zoom URL
//! validation) are answered inline, because the provider blocks on them.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use shared_types::{Integration, JobKind, Provider};

use crate::adapters::adapter_for;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Slack and Zoom reject v0 signatures whose timestamp is older than this.
const TIMESTAMP_WINDOW_SECS: i64 = 300;

fn hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a hex-encoded HMAC-SHA256 signature.
fn verify_hex_signature(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(sig) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(message);
    mac.verify_slice(&sig).is_ok()
}

/// The `v0=hex(hmac("v0:timestamp:body"))` scheme shared by Slack and Zoom.
fn verify_v0_signature(secret: &str, timestamp: &str, body: &[u8], header: &str) -> bool {
    let Some(signature_hex) = header.strip_prefix("v0=") else {
        return false;
    };
    let mut message = format!("v0:{}:", timestamp).into_bytes();
    message.extend_from_slice(body);
    verify_hex_signature(secret, &message, signature_hex)
}

fn timestamp_in_window(timestamp: &str, now_secs: i64) -> bool {
    match timestamp.parse::<i64>() {
        Ok(ts) => (now_secs - ts).abs() <= TIMESTAMP_WINDOW_SECS,
        Err(_) => false,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify a delivery against the provider's documented signing scheme.
fn verify_signature(provider: Provider, secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    match provider {
        Provider::Zoom => {
            let (Some(ts), Some(sig)) = (
                header_str(headers, "x-zm-request-timestamp"),
                header_str(headers, "x-zm-signature"),
            ) else {
                return false;
            };
            timestamp_in_window(ts, Utc::now().timestamp())
                && verify_v0_signature(secret, ts, body, sig)
        }
        Provider::Slack => {
            let (Some(ts), Some(sig)) = (
                header_str(headers, "x-slack-request-timestamp"),
                header_str(headers, "x-slack-signature"),
            ) else {
                return false;
            };
            timestamp_in_window(ts, Utc::now().timestamp())
                && verify_v0_signature(secret, ts, body, sig)
        }
        Provider::Linear => header_str(headers, "linear-signature")
            .map(|sig| verify_hex_signature(secret, body, sig))
            .unwrap_or(false),
        Provider::Dropbox => header_str(headers, "x-dropbox-signature")
            .map(|sig| verify_hex_signature(secret, body, sig))
            .unwrap_or(false),
    }
}

/// Inline answer for Zoom's endpoint validation handshake.
fn zoom_validation_answer(secret: &str, plain_token: &str) -> Value {
    json!({
        "plainToken": plain_token,
        "encryptedToken": hmac_hex(secret, plain_token.as_bytes()),
    })
}

/// A verified delivery is the first proof that the provider-side
/// subscription actually works; integrations advance to `registered` on the
/// first one and stay there.
fn newly_registered(integration: &Integration) -> bool {
    integration.webhook_state != "registered"
}

/// A handshake challenge that must be answered inline instead of enqueued.
fn challenge_response(provider: Provider, secret: &str, body: &[u8]) -> Option<Value> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    match provider {
        Provider::Zoom if parsed.get("event").and_then(Value::as_str)
            == Some("endpoint.url_validation") =>
        {
            let plain = parsed.pointer("/payload/plainToken").and_then(Value::as_str)?;
            Some(zoom_validation_answer(secret, plain))
        }
        Provider::Slack if parsed.get("type").and_then(Value::as_str)
            == Some("url_verification") =>
        {
            let challenge = parsed.get("challenge").and_then(Value::as_str)?;
            Some(json!({ "challenge": challenge }))
        }
        _ => None,
    }
}

/// POST /webhooks/:provider
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let provider: Provider = provider_name
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown provider: {}", provider_name)))?;

    let secret = state
        .config
        .credentials(provider)
        .and_then(|c| c.webhook_secret.as_deref())
        .ok_or_else(|| {
            ApiError::Unauthorized(format!("webhooks not configured for {}", provider))
        })?;

    if !verify_signature(provider, secret, &headers, &body) {
        tracing::warn!(provider = %provider, "rejected webhook with bad signature");
        return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
    }

    if let Some(answer) = challenge_response(provider, secret, &body) {
        return Ok(Json(answer));
    }

    let adapter = adapter_for(provider);
    let accounts = adapter
        .webhook_accounts(&body)
        .map_err(|e| ApiError::bad_request(format!("undecodable webhook payload: {}", e)))?;

    let mut conn = state.pool.get().await?;
    let targets = if accounts.is_empty() {
        // Payload named no account; fan out to every active integration of
        // this provider rather than dropping the delivery.
        db::integrations::list_active_by_provider(&mut conn, provider).await?
    } else {
        db::integrations::find_active_by_accounts(&mut conn, provider, &accounts).await?
    };

    let raw = String::from_utf8_lossy(&body).into_owned();
    let mut enqueued = 0usize;
    for integration in &targets {
        if newly_registered(integration) {
            db::integrations::set_webhook_state(&mut conn, integration.id, "registered").await?;
        }
        db::sync_jobs::enqueue(
            &mut conn,
            integration.id,
            JobKind::WebhookEvent,
            Some(raw.clone()),
        )
        .await?;
        enqueued += 1;
    }

    tracing::info!(provider = %provider, enqueued, "webhook accepted");
    Ok(Json(json!({ "ok": true, "enqueued": enqueued })))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn plain_hex_signature_round_trips() {
        let body = br#"{"action":"update"}"#;
        let sig = hmac_hex(SECRET, body);
        assert!(verify_hex_signature(SECRET, body, &sig));
        assert!(!verify_hex_signature(SECRET, b"other body", &sig));
        assert!(!verify_hex_signature("wrong-secret", body, &sig));
        assert!(!verify_hex_signature(SECRET, body, "zz not hex"));
    }

    #[test]
    fn v0_signature_round_trips() {
        let body = br#"{"event":"recording.completed"}"#;
        let ts = "1700000000";
        let mut message = format!("v0:{}:", ts).into_bytes();
        message.extend_from_slice(body);
        let header = format!("v0={}", hmac_hex(SECRET, &message));

        assert!(verify_v0_signature(SECRET, ts, body, &header));
        // Wrong timestamp changes the signed message.
        assert!(!verify_v0_signature(SECRET, "1700000001", body, &header));
        // Missing the v0= prefix.
        assert!(!verify_v0_signature(SECRET, ts, body, header.trim_start_matches("v0=")));
    }

    #[test]
    fn timestamp_window_enforced() {
        let now = 1_700_000_000;
        assert!(timestamp_in_window("1700000000", now));
        assert!(timestamp_in_window("1699999800", now));
        assert!(!timestamp_in_window("1699999000", now));
        // Future timestamps outside the window are equally invalid.
        assert!(!timestamp_in_window("1700001000", now));
        assert!(!timestamp_in_window("not-a-number", now));
    }

    #[test]
    fn zoom_validation_answer_signs_plain_token() {
        let answer = zoom_validation_answer(SECRET, "tok123");
        assert_eq!(answer["plainToken"], "tok123");
        assert_eq!(
            answer["encryptedToken"].as_str().unwrap(),
            hmac_hex(SECRET, b"tok123")
        );
    }

    fn integration_with_webhook_state(state: &str) -> Integration {
        let now = Utc::now();
        Integration {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            provider: "linear".to_string(),
            access_token: "lin_tok".to_string(),
            refresh_token: None,
            token_expires_at: None,
            external_account_id: "team_1".to_string(),
            webhook_state: state.to_string(),
            needs_reconnect: false,
            is_active: true,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn first_verified_delivery_registers_the_webhook() {
        assert!(newly_registered(&integration_with_webhook_state(
            "unregistered"
        )));
        // Already-registered integrations are not rewritten on every delivery.
        assert!(!newly_registered(&integration_with_webhook_state(
            "registered"
        )));
    }

    #[test]
    fn slack_url_verification_is_answered_inline() {
        let body = json!({"type": "url_verification", "challenge": "ch_42"}).to_string();
        let answer = challenge_response(Provider::Slack, SECRET, body.as_bytes()).unwrap();
        assert_eq!(answer["challenge"], "ch_42");
    }

    #[test]
    fn ordinary_events_are_not_challenges() {
        let body = json!({"type": "event_callback", "event": {"type": "message"}}).to_string();
        assert!(challenge_response(Provider::Slack, SECRET, body.as_bytes()).is_none());

        let body = json!({"event": "recording.completed", "payload": {}}).to_string();
        assert!(challenge_response(Provider::Zoom, SECRET, body.as_bytes()).is_none());
    }
}
