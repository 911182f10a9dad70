//! Slack adapter: channel messages via the Web API.
//!
//! Polling pages `conversations.list` (the cursor is Slack's list cursor) and
//! pulls a bounded window of recent history per channel. Slack reports
//! failures as HTTP 200 with `{"ok": false}`, so the ok flag is checked on
//! every response. Events-API webhooks carry the message inline.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use shared_types::{EntityKind, NormalizedEntity, Provider};

use super::{
    json_checked, transport, webhook_json, AdapterError, FetchPage, SyncAdapter, WebhookOutcome,
};

const API_BASE: &str = "https://slack.com/api";
const CHANNELS_PER_PAGE: &str = "20";
const MESSAGES_PER_CHANNEL: &str = "50";

pub struct SlackAdapter;

/// Slack wraps errors in 200 responses; translate the error strings that
/// matter into the shared taxonomy.
fn check_slack_ok(body: &Value) -> Result<(), AdapterError> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let error = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match error {
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
            Err(AdapterError::AuthRejected)
        }
        "ratelimited" => Err(AdapterError::RateLimited {
            retry_after_secs: 60,
        }),
        other => Err(AdapterError::Malformed(format!("slack error: {}", other))),
    }
}

/// Slack timestamps are strings like "1700000000.123456".
fn slack_ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    Utc.timestamp_opt(secs, micros * 1000).single()
}

fn message_entity(channel_id: &str, message: &Value) -> Option<NormalizedEntity> {
    let ts = message.get("ts").and_then(Value::as_str)?;

    let mut payload = message.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("channel_id".to_string(), Value::String(channel_id.to_string()));
    }

    Some(NormalizedEntity {
        // Message identity in Slack is (channel, ts).
        native_id: format!("{}:{}", channel_id, ts),
        kind: EntityKind::Message,
        payload,
        source_timestamp: slack_ts_to_datetime(ts).unwrap_or_else(Utc::now),
    })
}

fn parse_history(channel_id: &str, body: &Value) -> Vec<NormalizedEntity> {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| message_entity(channel_id, m))
                .collect()
        })
        .unwrap_or_default()
}

fn next_list_cursor(body: &Value) -> Option<String> {
    body.pointer("/response_metadata/next_cursor")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[async_trait]
impl SyncAdapter for SlackAdapter {
    fn provider(&self) -> Provider {
        Provider::Slack
    }

    async fn fetch_batch(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError> {
        let mut request = http
            .get(format!("{}/conversations.list", API_BASE))
            .bearer_auth(access_token)
            .query(&[
                ("limit", CHANNELS_PER_PAGE),
                ("types", "public_channel"),
                ("exclude_archived", "true"),
            ]);
        if let Some(c) = cursor {
            request = request.query(&[("cursor", c)]);
        }

        let response = request.send().await.map_err(transport)?;
        let body = json_checked(response).await?;
        check_slack_ok(&body)?;

        let channels: Vec<String> = body
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| AdapterError::Malformed("conversations.list missing channels".into()))?
            .iter()
            .filter_map(|c| c.get("id").and_then(Value::as_str))
            .map(String::from)
            .collect();

        let mut entities = Vec::new();
        for channel_id in &channels {
            let response = http
                .get(format!("{}/conversations.history", API_BASE))
                .bearer_auth(access_token)
                .query(&[
                    ("channel", channel_id.as_str()),
                    ("limit", MESSAGES_PER_CHANNEL),
                ])
                .send()
                .await
                .map_err(transport)?;
            let history = json_checked(response).await?;
            match check_slack_ok(&history) {
                Ok(()) => entities.extend(parse_history(channel_id, &history)),
                // The bot may simply not be in this channel; skip it.
                Err(AdapterError::Malformed(detail)) if detail.contains("not_in_channel") => {
                    tracing::debug!(channel = %channel_id, "skipping channel: {}", detail);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(FetchPage {
            entities,
            next_cursor: next_list_cursor(&body),
        })
    }

    fn translate_webhook(&self, raw: &[u8]) -> Result<WebhookOutcome, AdapterError> {
        let body = webhook_json(raw)?;
        let kind = body.get("type").and_then(Value::as_str).unwrap_or_default();

        // url_verification is answered inline by the ingress; other
        // non-event callbacks carry nothing to store.
        if kind != "event_callback" {
            return Ok(WebhookOutcome::Entities(vec![]));
        }

        let event = body
            .get("event")
            .ok_or_else(|| AdapterError::Malformed("event_callback missing event".into()))?;
        if event.get("type").and_then(Value::as_str) != Some("message") {
            return Ok(WebhookOutcome::Entities(vec![]));
        }

        let channel = event
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Malformed("message event missing channel".into()))?;

        Ok(WebhookOutcome::Entities(
            message_entity(channel, event).into_iter().collect(),
        ))
    }

    fn webhook_accounts(&self, raw: &[u8]) -> Result<Vec<String>, AdapterError> {
        let body = webhook_json(raw)?;
        Ok(body
            .get("team_id")
            .and_then(Value::as_str)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default())
    }

    async fn account_id(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<String, AdapterError> {
        let response = http
            .get(format!("{}/team.info", API_BASE))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        let body = json_checked(response).await?;
        check_slack_ok(&body)?;

        body.pointer("/team/id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| AdapterError::Malformed("team.info missing team id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slack_ok_false_maps_to_taxonomy() {
        assert!(check_slack_ok(&json!({"ok": true})).is_ok());
        assert!(matches!(
            check_slack_ok(&json!({"ok": false, "error": "invalid_auth"})),
            Err(AdapterError::AuthRejected)
        ));
        assert!(matches!(
            check_slack_ok(&json!({"ok": false, "error": "token_revoked"})),
            Err(AdapterError::AuthRejected)
        ));
        assert!(matches!(
            check_slack_ok(&json!({"ok": false, "error": "ratelimited"})),
            Err(AdapterError::RateLimited { retry_after_secs: 60 })
        ));
        assert!(matches!(
            check_slack_ok(&json!({"ok": false, "error": "channel_not_found"})),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn slack_ts_conversion() {
        let dt = slack_ts_to_datetime("1700000000.123456").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_micros(), 123_456);

        assert!(slack_ts_to_datetime("garbage").is_none());
    }

    #[test]
    fn history_messages_become_entities() {
        let body = json!({
            "ok": true,
            "messages": [
                {"type": "message", "user": "U1", "text": "hello", "ts": "1700000001.000100"},
                {"type": "message", "user": "U2", "text": "hi", "ts": "1700000002.000200"},
            ]
        });

        let entities = parse_history("C123", &body);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].native_id, "C123:1700000001.000100");
        assert_eq!(entities[0].kind, EntityKind::Message);
        assert_eq!(entities[0].payload["channel_id"], "C123");
    }

    #[test]
    fn message_event_webhook_yields_entity() {
        let raw = json!({
            "type": "event_callback",
            "team_id": "T999",
            "event": {
                "type": "message",
                "channel": "C42",
                "user": "U7",
                "text": "deployed!",
                "ts": "1700000100.000000",
            }
        })
        .to_string();

        let outcome = SlackAdapter.translate_webhook(raw.as_bytes()).unwrap();
        match outcome {
            WebhookOutcome::Entities(entities) => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].native_id, "C42:1700000100.000000");
            }
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn url_verification_yields_nothing() {
        let raw = json!({"type": "url_verification", "challenge": "abc"}).to_string();
        let outcome = SlackAdapter.translate_webhook(raw.as_bytes()).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Entities(v) if v.is_empty()));
    }

    #[test]
    fn non_message_event_yields_nothing() {
        let raw = json!({
            "type": "event_callback",
            "team_id": "T999",
            "event": {"type": "reaction_added", "user": "U7"},
        })
        .to_string();
        let outcome = SlackAdapter.translate_webhook(raw.as_bytes()).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Entities(v) if v.is_empty()));
    }

    #[test]
    fn webhook_accounts_reads_team_id() {
        let raw = json!({"type": "event_callback", "team_id": "T123", "event": {}}).to_string();
        let accounts = SlackAdapter.webhook_accounts(raw.as_bytes()).unwrap();
        assert_eq!(accounts, vec!["T123".to_string()]);
    }
}
