//! Linear adapter: issues via the GraphQL API.
//!
//! Polling walks the `issues` connection with `after`/`endCursor`. Linear
//! access tokens do not expire and there is no refresh token. Webhooks carry
//! the changed issue inline.

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::{EntityKind, NormalizedEntity, Provider};

use super::{
    json_checked, parse_timestamp, transport, webhook_json, AdapterError, FetchPage, SyncAdapter,
    WebhookOutcome,
};

const GRAPHQL_URL: &str = "https://api.linear.app/graphql";

const ISSUES_QUERY: &str = "\
query Issues($after: String) {
  issues(first: 50, after: $after) {
    nodes { id identifier title description url createdAt updatedAt state { name } }
    pageInfo { hasNextPage endCursor }
  }
}";

const VIEWER_ORG_QUERY: &str = "query { organization { id } }";

pub struct LinearAdapter;

fn issue_entity(issue: &Value) -> Option<NormalizedEntity> {
    let native_id = issue.get("id").and_then(Value::as_str)?.to_string();

    Some(NormalizedEntity {
        native_id,
        kind: EntityKind::Issue,
        payload: issue.clone(),
        source_timestamp: parse_timestamp(issue.get("updatedAt").and_then(Value::as_str)),
    })
}

fn parse_issues_page(body: &Value) -> Result<FetchPage, AdapterError> {
    if let Some(errors) = body.get("errors") {
        return Err(AdapterError::Malformed(format!(
            "graphql errors: {}",
            errors
        )));
    }

    let connection = body
        .pointer("/data/issues")
        .ok_or_else(|| AdapterError::Malformed("issues response missing data.issues".into()))?;

    let nodes = connection
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Malformed("issues response missing nodes".into()))?;

    let entities = nodes.iter().filter_map(issue_entity).collect();

    let has_next = connection
        .pointer("/pageInfo/hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next {
        connection
            .pointer("/pageInfo/endCursor")
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
impl SyncAdapter for LinearAdapter {
    fn provider(&self) -> Provider {
        Provider::Linear
    }

    async fn fetch_batch(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError> {
        let response = http
            .post(GRAPHQL_URL)
            .bearer_auth(access_token)
            .json(&json!({
                "query": ISSUES_QUERY,
                "variables": { "after": cursor },
            }))
            .send()
            .await
            .map_err(transport)?;

        let body = json_checked(response).await?;
        parse_issues_page(&body)
    }

    fn translate_webhook(&self, raw: &[u8]) -> Result<WebhookOutcome, AdapterError> {
        let body = webhook_json(raw)?;

        let entity_type = body.get("type").and_then(Value::as_str).unwrap_or_default();
        let action = body
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default();

        // Deletions and non-issue resources are out of scope for the local
        // store; the payload is still a valid delivery.
        if entity_type != "Issue" || !matches!(action, "create" | "update") {
            return Ok(WebhookOutcome::Entities(vec![]));
        }

        let data = body
            .get("data")
            .ok_or_else(|| AdapterError::Malformed("linear webhook missing data".into()))?;
        let entity = issue_entity(data)
            .ok_or_else(|| AdapterError::Malformed("linear webhook data missing id".into()))?;

        Ok(WebhookOutcome::Entities(vec![entity]))
    }

    fn webhook_accounts(&self, raw: &[u8]) -> Result<Vec<String>, AdapterError> {
        let body = webhook_json(raw)?;
        Ok(body
            .get("organizationId")
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
            .post(GRAPHQL_URL)
            .bearer_auth(access_token)
            .json(&json!({ "query": VIEWER_ORG_QUERY }))
            .send()
            .await
            .map_err(transport)?;
        let body = json_checked(response).await?;

        body.pointer("/data/organization/id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| AdapterError::Malformed("organization query missing id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_page_with_next_cursor() {
        let body = json!({
            "data": {
                "issues": {
                    "nodes": [
                        {"id": "iss_1", "identifier": "ENG-1", "title": "Fix login",
                         "updatedAt": "2024-04-01T08:00:00.000Z"},
                    ],
                    "pageInfo": {"hasNextPage": true, "endCursor": "cur_abc"},
                }
            }
        });

        let page = parse_issues_page(&body).unwrap();
        assert_eq!(page.entities.len(), 1);
        assert_eq!(page.entities[0].native_id, "iss_1");
        assert_eq!(page.entities[0].kind, EntityKind::Issue);
        assert_eq!(page.next_cursor.as_deref(), Some("cur_abc"));
    }

    #[test]
    fn last_page_has_no_cursor() {
        let body = json!({
            "data": {
                "issues": {
                    "nodes": [],
                    "pageInfo": {"hasNextPage": false, "endCursor": "cur_tail"},
                }
            }
        });

        let page = parse_issues_page(&body).unwrap();
        assert!(page.entities.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn graphql_errors_are_malformed() {
        let body = json!({"errors": [{"message": "unknown field"}]});
        assert!(matches!(
            parse_issues_page(&body),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn issue_update_webhook_yields_entity() {
        let raw = json!({
            "action": "update",
            "type": "Issue",
            "organizationId": "org_1",
            "data": {"id": "iss_9", "title": "Ship it", "updatedAt": "2024-04-02T12:30:00.000Z"},
        })
        .to_string();

        let outcome = LinearAdapter.translate_webhook(raw.as_bytes()).unwrap();
        match outcome {
            WebhookOutcome::Entities(entities) => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].native_id, "iss_9");
            }
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn non_issue_webhook_yields_nothing() {
        let raw = json!({"action": "create", "type": "Comment", "data": {"id": "c_1"}})
            .to_string();
        let outcome = LinearAdapter.translate_webhook(raw.as_bytes()).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Entities(v) if v.is_empty()));
    }

    #[test]
    fn issue_delete_webhook_yields_nothing() {
        let raw = json!({"action": "remove", "type": "Issue", "data": {"id": "iss_2"}})
            .to_string();
        let outcome = LinearAdapter.translate_webhook(raw.as_bytes()).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Entities(v) if v.is_empty()));
    }

    #[test]
    fn webhook_accounts_reads_organization() {
        let raw = json!({"action": "update", "type": "Issue", "organizationId": "org_7",
                         "data": {"id": "iss_1"}})
        .to_string();
        let accounts = LinearAdapter.webhook_accounts(raw.as_bytes()).unwrap();
        assert_eq!(accounts, vec!["org_7".to_string()]);
    }
}
