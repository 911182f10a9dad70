//! Provider adapters: the polymorphic seam between the generic sync engine
//! and each external service's API.
//!
//! An adapter knows two things: how to fetch a page of records given an
//! access token and an optional cursor, and how to translate an inbound
//! webhook payload into normalized entities (or into a rescan request when
//! the provider only sends "something changed" pings). Everything else —
//! tokens, retries, persistence — lives outside the adapters.

mod dropbox;
mod linear;
mod slack;
mod zoom;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared_types::{NormalizedEntity, Provider};
use thiserror::Error;

pub use dropbox::DropboxAdapter;
pub use linear::LinearAdapter;
pub use slack::SlackAdapter;
pub use zoom::ZoomAdapter;

/// Error taxonomy shared by every adapter. The runner maps these onto retry
/// decisions; adapters only classify, they never retry themselves.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Token invalid despite being unexpired. The runner refreshes once
    /// out-of-band and retries; a second rejection fails the job.
    #[error("provider rejected the access token")]
    AuthRejected,

    /// Provider asked us to slow down; the job is re-enqueued with exactly
    /// this delay instead of the default backoff.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Network-level trouble or provider 5xx; normal retry path.
    #[error("transient error: {0}")]
    Transient(String),

    /// The response violated the provider's documented contract. Not
    /// retried; logged for developer triage.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// One page of fetched records.
#[derive(Debug)]
pub struct FetchPage {
    pub entities: Vec<NormalizedEntity>,
    pub next_cursor: Option<String>,
}

/// Returned by `translate_webhook` when the payload carries no record data
/// and the runner should fetch instead. `hint` scopes the fetch when the
/// provider named a specific record.
#[derive(Debug, PartialEq)]
pub struct RescanRequest {
    pub hint: Option<String>,
}

/// What a webhook payload amounts to.
#[derive(Debug)]
pub enum WebhookOutcome {
    Entities(Vec<NormalizedEntity>),
    Rescan(RescanRequest),
}

#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetch one page of records. "No new data" is an empty `Ok` page,
    /// never an error.
    async fn fetch_batch(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError>;

    /// Fetch only the records named by a rescan hint, when the provider has
    /// a narrow lookup for it. `Ok(None)` means no narrow path exists and
    /// the runner should fall back to a full sweep.
    async fn fetch_scoped(
        &self,
        _http: &reqwest::Client,
        _access_token: &str,
        _hint: &str,
    ) -> Result<Option<Vec<NormalizedEntity>>, AdapterError> {
        Ok(None)
    }

    /// Translate a raw webhook body into entities or a rescan request.
    fn translate_webhook(&self, raw: &[u8]) -> Result<WebhookOutcome, AdapterError>;

    /// Provider-side account/team ids named by a webhook payload, used by
    /// the ingress to find the owning integration(s).
    fn webhook_accounts(&self, raw: &[u8]) -> Result<Vec<String>, AdapterError>;

    /// The account/team id behind an access token, fetched at connect time
    /// when the token response does not carry one.
    async fn account_id(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<String, AdapterError>;
}

/// Tagged dispatch from the provider enum to its adapter.
pub fn adapter_for(provider: Provider) -> &'static dyn SyncAdapter {
    match provider {
        Provider::Zoom => &ZoomAdapter,
        Provider::Linear => &LinearAdapter,
        Provider::Slack => &SlackAdapter,
        Provider::Dropbox => &DropboxAdapter,
    }
}

/// Map an HTTP status onto the taxonomy; `None` means the status is fine.
pub(crate) fn classify_status(status: u16, retry_after: Option<u64>) -> Option<AdapterError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(AdapterError::AuthRejected),
        429 => Some(AdapterError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        }),
        500..=599 => Some(AdapterError::Transient(format!(
            "provider returned {}",
            status
        ))),
        other => Some(AdapterError::Malformed(format!(
            "unexpected status {}",
            other
        ))),
    }
}

/// Check a response's status, consuming it into a JSON value on success.
pub(crate) async fn json_checked(response: reqwest::Response) -> Result<Value, AdapterError> {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    if let Some(err) = classify_status(status, retry_after) {
        return Err(err);
    }

    response
        .json()
        .await
        .map_err(|e| AdapterError::Malformed(format!("undecodable body: {}", e)))
}

pub(crate) fn transport(e: reqwest::Error) -> AdapterError {
    AdapterError::Transient(e.to_string())
}

/// Parse a raw webhook body as JSON, or classify it as malformed.
pub(crate) fn webhook_json(raw: &[u8]) -> Result<Value, AdapterError> {
    serde_json::from_slice(raw)
        .map_err(|e| AdapterError::Malformed(format!("webhook body is not JSON: {}", e)))
}

/// RFC 3339 timestamp, falling back to "now" — a record with a garbled
/// timestamp is still worth storing.
pub(crate) fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(200, None).is_none());
        assert!(matches!(
            classify_status(401, None),
            Some(AdapterError::AuthRejected)
        ));
        assert!(matches!(
            classify_status(403, None),
            Some(AdapterError::AuthRejected)
        ));
        assert!(matches!(
            classify_status(429, Some(17)),
            Some(AdapterError::RateLimited {
                retry_after_secs: 17
            })
        ));
        // Missing Retry-After falls back to 60s.
        assert!(matches!(
            classify_status(429, None),
            Some(AdapterError::RateLimited {
                retry_after_secs: 60
            })
        ));
        assert!(matches!(
            classify_status(503, None),
            Some(AdapterError::Transient(_))
        ));
        assert!(matches!(
            classify_status(418, None),
            Some(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn response_status_checked_before_decoding() {
        tokio_test::block_on(async {
            let throttled = reqwest::Response::from(
                axum::http::Response::builder()
                    .status(429)
                    .header("retry-after", "7")
                    .body("slow down")
                    .unwrap(),
            );
            let err = json_checked(throttled).await.unwrap_err();
            assert!(matches!(
                err,
                AdapterError::RateLimited {
                    retry_after_secs: 7
                }
            ));

            let ok = reqwest::Response::from(
                axum::http::Response::builder()
                    .status(200)
                    .body(r#"{"ok":true}"#)
                    .unwrap(),
            );
            let body = json_checked(ok).await.unwrap();
            assert_eq!(body["ok"], true);
        });
    }

    #[test]
    fn undecodable_success_body_is_malformed() {
        tokio_test::block_on(async {
            let garbled = reqwest::Response::from(
                axum::http::Response::builder()
                    .status(200)
                    .body("<html>not json</html>")
                    .unwrap(),
            );
            let err = json_checked(garbled).await.unwrap_err();
            assert!(matches!(err, AdapterError::Malformed(_)));
        });
    }

    #[test]
    fn garbage_webhook_body_is_malformed() {
        assert!(matches!(
            webhook_json(b"not json at all"),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn timestamp_parsing_falls_back_to_now() {
        let parsed = parse_timestamp(Some("2024-03-01T12:00:00Z"));
        assert_eq!(parsed.timestamp(), 1_709_294_400);

        let before = Utc::now();
        let fallback = parse_timestamp(Some("garbage"));
        assert!(fallback >= before);
    }
}
