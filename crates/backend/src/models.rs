// Database models for Diesel
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared_types::{JobKind, JobStatus, SyncJobResponse};
use uuid::Uuid;

/// Database representation of sync_jobs.
///
/// Derives `QueryableByName` as well because the claim path goes through
/// `diesel::sql_query` (the claim must be one conditional UPDATE).
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = crate::schema::sync_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SyncJobRow {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub kind: String,
    pub status: String,
    pub payload: Option<String>,
    pub attempt_count: i32,
    pub lineage: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncJobRow {
    pub fn kind(&self) -> Result<JobKind, String> {
        self.kind.parse()
    }

    pub fn status(&self) -> Result<JobStatus, String> {
        self.status.parse()
    }
}

impl From<SyncJobRow> for SyncJobResponse {
    fn from(row: SyncJobRow) -> Self {
        SyncJobResponse {
            id: row.id,
            integration_id: row.integration_id,
            kind: row.kind,
            status: row.status,
            attempt_count: row.attempt_count,
            lineage: row.lineage,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
        }
    }
}

/// Insertable struct for new sync jobs
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::sync_jobs)]
pub struct NewSyncJob {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub kind: String,
    pub status: String,
    pub payload: Option<String>,
    pub attempt_count: i32,
    pub lineage: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insertable struct for new integrations
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::integrations)]
pub struct NewIntegration {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub external_account_id: String,
    pub webhook_state: String,
    pub needs_reconnect: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insertable struct for synced entities (upserted by natural key)
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::synced_entities)]
pub struct NewSyncedEntity {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub integration_id: Uuid,
    pub provider: String,
    pub native_id: String,
    pub kind: String,
    pub payload: String,
    pub source_timestamp: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> SyncJobRow {
        SyncJobRow {
            id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            kind: "incremental_sync".to_string(),
            status: "pending".to_string(),
            payload: None,
            attempt_count: 2,
            lineage: 1,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: Some("503".to_string()),
        }
    }

    #[test]
    fn row_parses_kind_and_status() {
        let row = sample_row();
        assert_eq!(row.kind().unwrap(), JobKind::IncrementalSync);
        assert_eq!(row.status().unwrap(), JobStatus::Pending);

        let mut bad = sample_row();
        bad.kind = "defrag".to_string();
        assert!(bad.kind().is_err());
    }

    #[test]
    fn row_converts_to_response() {
        let row = sample_row();
        let response = SyncJobResponse::from(row.clone());
        assert_eq!(response.id, row.id);
        assert_eq!(response.attempt_count, 2);
        assert_eq!(response.lineage, 1);
        assert_eq!(response.last_error.as_deref(), Some("503"));
    }
}
