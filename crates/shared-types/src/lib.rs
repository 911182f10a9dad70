use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External services the sync engine can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Meeting recordings and transcripts
    Zoom,
    /// Issue tracker
    Linear,
    /// Chat workspace
    Slack,
    /// File storage
    Dropbox,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Zoom,
        Provider::Linear,
        Provider::Slack,
        Provider::Dropbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Zoom => "zoom",
            Provider::Linear => "linear",
            Provider::Slack => "slack",
            Provider::Dropbox => "dropbox",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zoom" => Ok(Provider::Zoom),
            "linear" => Ok(Provider::Linear),
            "slack" => Ok(Provider::Slack),
            "dropbox" => Ok(Provider::Dropbox),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sync job is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSync,
    IncrementalSync,
    WebhookEvent,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullSync => "full_sync",
            JobKind::IncrementalSync => "incremental_sync",
            JobKind::WebhookEvent => "webhook_event",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_sync" => Ok(JobKind::FullSync),
            "incremental_sync" => Ok(JobKind::IncrementalSync),
            "webhook_event" => Ok(JobKind::WebhookEvent),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Lifecycle state of a sync job.
///
/// Transitions are monotonic: `pending -> running -> {succeeded | failed}`.
/// A terminal job is never reopened; retries are new rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `next` is a legal successor state of `self`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Kind of record an adapter produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Meeting,
    Issue,
    Message,
    File,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Meeting => "meeting",
            EntityKind::Issue => "issue",
            EntityKind::Message => "message",
            EntityKind::File => "file",
        }
    }
}

/// Integration struct matching database column order exactly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::Queryable))]
pub struct Integration {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub provider: String, // stored as VARCHAR: "zoom", "linear", "slack", "dropbox"
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub external_account_id: String,
    pub webhook_state: String, // "unregistered" | "registered"
    pub needs_reconnect: bool,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn provider(&self) -> Result<Provider, String> {
        self.provider.parse()
    }
}

/// A provider-agnostic record produced by an adapter, ready for idempotent
/// storage. `(provider, native_id)` is the natural key within one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub native_id: String,
    pub kind: EntityKind,
    pub payload: serde_json::Value,
    pub source_timestamp: DateTime<Utc>,
}

// API Request/Response types

/// Integration as exposed over the API. Tokens never leave the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResponse {
    pub id: Uuid,
    pub provider: String,
    pub external_account_id: String,
    pub webhook_state: String,
    pub needs_reconnect: bool,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Integration> for IntegrationResponse {
    fn from(i: Integration) -> Self {
        IntegrationResponse {
            id: i.id,
            provider: i.provider,
            external_account_id: i.external_account_id,
            webhook_state: i.webhook_state,
            needs_reconnect: i.needs_reconnect,
            is_active: i.is_active,
            last_synced_at: i.last_synced_at,
            created_at: i.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNowRequest {
    pub integration_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuedJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobResponse {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub kind: String,
    pub status: String,
    pub attempt_count: i32,
    pub lineage: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessJobsResponse {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
        assert!("jira".parse::<Provider>().is_err());
    }

    #[test]
    fn job_status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));

        // No skipping running, no leaving a terminal state.
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        for k in [
            JobKind::FullSync,
            JobKind::IncrementalSync,
            JobKind::WebhookEvent,
        ] {
            assert_eq!(k.as_str().parse::<JobKind>().unwrap(), k);
        }
    }
}
