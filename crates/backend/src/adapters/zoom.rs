//! Zoom adapter: cloud recordings and their transcripts.
//!
//! Polling pages `GET /v2/users/me/recordings` with `next_page_token`.
//! Webhooks deliver `recording.completed` with the meeting object inline;
//! events that only name a meeting id degrade to a scoped rescan.

use async_trait::async_trait;
use serde_json::Value;
use shared_types::{EntityKind, NormalizedEntity, Provider};

use super::{
    json_checked, parse_timestamp, transport, webhook_json, AdapterError, FetchPage,
    RescanRequest, SyncAdapter, WebhookOutcome,
};

const API_BASE: &str = "https://api.zoom.us/v2";
const PAGE_SIZE: &str = "30";

pub struct ZoomAdapter;

fn meeting_entity(meeting: &Value) -> Option<NormalizedEntity> {
    // Meeting UUIDs are the stable identity; numeric ids are reused.
    let native_id = meeting
        .get("uuid")
        .and_then(Value::as_str)
        .or_else(|| meeting.get("id").and_then(Value::as_str))?
        .to_string();

    Some(NormalizedEntity {
        native_id,
        kind: EntityKind::Meeting,
        payload: meeting.clone(),
        source_timestamp: parse_timestamp(meeting.get("start_time").and_then(Value::as_str)),
    })
}

fn parse_recordings_page(body: &Value) -> Result<FetchPage, AdapterError> {
    let meetings = body
        .get("meetings")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Malformed("recordings response missing meetings".into()))?;

    let entities = meetings.iter().filter_map(meeting_entity).collect();

    let next_cursor = body
        .get("next_page_token")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    Ok(FetchPage {
        entities,
        next_cursor,
    })
}

#[async_trait]
impl SyncAdapter for ZoomAdapter {
    fn provider(&self) -> Provider {
        Provider::Zoom
    }

    async fn fetch_batch(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError> {
        let mut request = http
            .get(format!("{}/users/me/recordings", API_BASE))
            .bearer_auth(access_token)
            .query(&[("page_size", PAGE_SIZE)]);
        if let Some(token) = cursor {
            request = request.query(&[("next_page_token", token)]);
        }

        let response = request.send().await.map_err(transport)?;
        let body = json_checked(response).await?;
        parse_recordings_page(&body)
    }

    async fn fetch_scoped(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        hint: &str,
    ) -> Result<Option<Vec<NormalizedEntity>>, AdapterError> {
        let response = http
            .get(format!(
                "{}/meetings/{}/recordings",
                API_BASE,
                urlencoding::encode(hint)
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;

        // A trashed or deleted meeting has no recordings left to mirror.
        if response.status().as_u16() == 404 {
            return Ok(Some(vec![]));
        }

        let body = json_checked(response).await?;
        Ok(Some(meeting_entity(&body).into_iter().collect()))
    }

    fn translate_webhook(&self, raw: &[u8]) -> Result<WebhookOutcome, AdapterError> {
        let body = webhook_json(raw)?;
        let event = body
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Malformed("zoom webhook missing event".into()))?;

        if !event.starts_with("recording.") {
            // Other event families are subscribed away; tolerate them.
            return Ok(WebhookOutcome::Entities(vec![]));
        }

        let object = body.pointer("/payload/object");
        match object.and_then(meeting_entity) {
            Some(entity) => Ok(WebhookOutcome::Entities(vec![entity])),
            None => {
                // Notification without the full object: rescan, scoped by the
                // meeting id when one was named.
                let hint = object
                    .and_then(|o| o.get("id"))
                    .map(|id| match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                Ok(WebhookOutcome::Rescan(RescanRequest { hint }))
            }
        }
    }

    fn webhook_accounts(&self, raw: &[u8]) -> Result<Vec<String>, AdapterError> {
        let body = webhook_json(raw)?;
        Ok(body
            .pointer("/payload/account_id")
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
            .get(format!("{}/users/me", API_BASE))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        let body = json_checked(response).await?;

        body.get("account_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| AdapterError::Malformed("zoom user profile missing account_id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_recordings_page_with_cursor() {
        let body = json!({
            "meetings": [
                {"uuid": "abc==", "topic": "Standup", "start_time": "2024-03-01T09:00:00Z"},
                {"uuid": "def==", "topic": "Retro", "start_time": "2024-03-01T15:00:00Z"},
            ],
            "next_page_token": "tok123",
        });

        let page = parse_recordings_page(&body).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.entities[0].native_id, "abc==");
        assert_eq!(page.entities[0].kind, EntityKind::Meeting);
        assert_eq!(page.next_cursor.as_deref(), Some("tok123"));
    }

    #[test]
    fn empty_page_token_means_exhausted() {
        let body = json!({"meetings": [], "next_page_token": ""});
        let page = parse_recordings_page(&body).unwrap();
        assert!(page.entities.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn missing_meetings_is_malformed() {
        let err = parse_recordings_page(&json!({"total_records": 3})).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }

    #[test]
    fn recording_completed_yields_entity() {
        let raw = json!({
            "event": "recording.completed",
            "payload": {
                "account_id": "acct_1",
                "object": {
                    "uuid": "mtg-uuid==",
                    "topic": "Weekly sync",
                    "start_time": "2024-03-02T10:00:00Z",
                }
            }
        })
        .to_string();

        let outcome = ZoomAdapter.translate_webhook(raw.as_bytes()).unwrap();
        match outcome {
            WebhookOutcome::Entities(entities) => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].native_id, "mtg-uuid==");
            }
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn recording_event_without_object_rescans_with_hint() {
        let raw = json!({
            "event": "recording.trashed",
            "payload": {"account_id": "acct_1", "object": {"id": 12345}}
        })
        .to_string();

        let outcome = ZoomAdapter.translate_webhook(raw.as_bytes()).unwrap();
        match outcome {
            WebhookOutcome::Rescan(req) => assert_eq!(req.hint.as_deref(), Some("12345")),
            other => panic!("expected rescan, got {:?}", other),
        }
    }

    #[test]
    fn unrelated_event_yields_nothing() {
        let raw = json!({"event": "meeting.started", "payload": {}}).to_string();
        let outcome = ZoomAdapter.translate_webhook(raw.as_bytes()).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Entities(v) if v.is_empty()));
    }

    #[test]
    fn webhook_accounts_extracts_account_id() {
        let raw = json!({"event": "recording.completed", "payload": {"account_id": "acct_9"}})
            .to_string();
        let accounts = ZoomAdapter.webhook_accounts(raw.as_bytes()).unwrap();
        assert_eq!(accounts, vec!["acct_9".to_string()]);
    }
}
