//! Dropbox adapter: file metadata via `files/list_folder`.
//!
//! Dropbox webhooks are notification-only — they name accounts, never files —
//! so `translate_webhook` always asks the runner to rescan. Polling drives
//! `list_folder` / `list_folder/continue` with Dropbox's own cursor.

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::{EntityKind, NormalizedEntity, Provider};

use super::{
    json_checked, parse_timestamp, transport, webhook_json, AdapterError, FetchPage,
    RescanRequest, SyncAdapter, WebhookOutcome,
};

const API_BASE: &str = "https://api.dropboxapi.com/2";

pub struct DropboxAdapter;

fn file_entity(entry: &Value) -> Option<NormalizedEntity> {
    // Folders and deletions are skipped; only file entries are stored.
    if entry.get(".tag").and_then(Value::as_str) != Some("file") {
        return None;
    }
    let native_id = entry.get("id").and_then(Value::as_str)?.to_string();

    Some(NormalizedEntity {
        native_id,
        kind: EntityKind::File,
        payload: entry.clone(),
        source_timestamp: parse_timestamp(entry.get("server_modified").and_then(Value::as_str)),
    })
}

fn parse_list_folder_page(body: &Value) -> Result<FetchPage, AdapterError> {
    let entries = body
        .get("entries")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Malformed("list_folder response missing entries".into()))?;

    let entities = entries.iter().filter_map(file_entity).collect();

    let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
    let next_cursor = if has_more {
        body.get("cursor")
            .and_then(Value::as_str)
            .map(String::from)
    } else {
        None
    };

    Ok(FetchPage {
        entities,
        next_cursor,
    })
}

#[async_trait]
impl SyncAdapter for DropboxAdapter {
    fn provider(&self) -> Provider {
        Provider::Dropbox
    }

    async fn fetch_batch(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError> {
        let request = match cursor {
            Some(c) => http
                .post(format!("{}/files/list_folder/continue", API_BASE))
                .bearer_auth(access_token)
                .json(&json!({ "cursor": c })),
            None => http
                .post(format!("{}/files/list_folder", API_BASE))
                .bearer_auth(access_token)
                .json(&json!({ "path": "", "recursive": true, "limit": 100 })),
        };

        let response = request.send().await.map_err(transport)?;
        let body = json_checked(response).await?;
        parse_list_folder_page(&body)
    }

    fn translate_webhook(&self, raw: &[u8]) -> Result<WebhookOutcome, AdapterError> {
        let body = webhook_json(raw)?;

        // Any well-formed Dropbox notification means "list again"; the
        // payload never carries file data.
        if body.get("list_folder").is_some() || body.get("delta").is_some() {
            return Ok(WebhookOutcome::Rescan(RescanRequest { hint: None }));
        }

        Err(AdapterError::Malformed(
            "dropbox webhook without list_folder or delta".into(),
        ))
    }

    fn webhook_accounts(&self, raw: &[u8]) -> Result<Vec<String>, AdapterError> {
        let body = webhook_json(raw)?;
        Ok(body
            .pointer("/list_folder/accounts")
            .and_then(Value::as_array)
            .map(|accounts| {
                accounts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn account_id(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<String, AdapterError> {
        let response = http
            .post(format!("{}/users/get_current_account", API_BASE))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        let body = json_checked(response).await?;

        body.get("account_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                AdapterError::Malformed("get_current_account missing account_id".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_entries_and_cursor() {
        let body = json!({
            "entries": [
                {".tag": "file", "id": "id:aaa", "name": "notes.txt",
                 "server_modified": "2024-05-01T10:00:00Z"},
                {".tag": "folder", "id": "id:bbb", "name": "docs"},
                {".tag": "deleted", "name": "old.txt"},
            ],
            "cursor": "cur_1",
            "has_more": true,
        });

        let page = parse_list_folder_page(&body).unwrap();
        assert_eq!(page.entities.len(), 1);
        assert_eq!(page.entities[0].native_id, "id:aaa");
        assert_eq!(page.entities[0].kind, EntityKind::File);
        assert_eq!(page.next_cursor.as_deref(), Some("cur_1"));
    }

    #[test]
    fn exhausted_listing_has_no_cursor() {
        let body = json!({"entries": [], "cursor": "cur_2", "has_more": false});
        let page = parse_list_folder_page(&body).unwrap();
        assert!(page.entities.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn notification_webhook_requests_rescan() {
        let raw = json!({
            "list_folder": {"accounts": ["dbid:AAA", "dbid:BBB"]},
            "delta": {"users": [12345]},
        })
        .to_string();

        let outcome = DropboxAdapter.translate_webhook(raw.as_bytes()).unwrap();
        match outcome {
            WebhookOutcome::Rescan(req) => assert_eq!(req.hint, None),
            other => panic!("expected rescan, got {:?}", other),
        }
    }

    #[test]
    fn unrecognized_webhook_is_malformed() {
        let raw = json!({"something": "else"}).to_string();
        assert!(matches!(
            DropboxAdapter.translate_webhook(raw.as_bytes()),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn webhook_accounts_lists_all_accounts() {
        let raw = json!({"list_folder": {"accounts": ["dbid:AAA", "dbid:BBB"]}}).to_string();
        let accounts = DropboxAdapter.webhook_accounts(raw.as_bytes()).unwrap();
        assert_eq!(accounts, vec!["dbid:AAA".to_string(), "dbid:BBB".to_string()]);
    }
}
