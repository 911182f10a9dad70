//! Background job runner: claims pending sync jobs and executes them.
//!
//! One worker loop per process, plus an on-demand drain behind
//! `/internal/process-jobs` for deployments without long-lived workers.
//! Claiming is delegated to the queue's conditional UPDATE, so any number of
//! drains can run concurrently without double-processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel_async::AsyncPgConnection;
use shared_types::{Integration, JobKind, ProcessJobsResponse};
use tokio::time::MissedTickBehavior;

use crate::adapters::{adapter_for, AdapterError, SyncAdapter, WebhookOutcome};
use crate::config::AppConfig;
use crate::db::{self, DbPool};
use crate::models::SyncJobRow;
use crate::oauth::{self, OAuthError};

/// How a failed job should be handled.
struct JobFailure {
    message: String,
    /// `Some(delay)` re-enqueues a lineage successor after the delay;
    /// `None` leaves the job terminally failed.
    retry: Option<Duration>,
    /// The provider no longer honors this integration's credentials; the
    /// user has to reconnect.
    needs_reconnect: bool,
}

impl JobFailure {
    fn retryable(message: String, delay: Duration) -> Self {
        Self {
            message,
            retry: Some(delay),
            needs_reconnect: false,
        }
    }

    fn terminal(message: String) -> Self {
        Self {
            message,
            retry: None,
            needs_reconnect: false,
        }
    }
}

/// Exponential backoff for retryable failures: 30s doubling per attempt.
/// Rate limits bypass this and use the provider's own delay.
fn default_backoff(attempt_count: i32) -> Duration {
    let attempt = attempt_count.clamp(0, 10) as u32;
    Duration::from_secs(30u64 << attempt)
}

/// Jobs claimed before this instant and still `running` belong to a worker
/// that died mid-job. Twice the job timeout: a live worker either finishes
/// or times its job out well inside that.
fn stale_cutoff(now: DateTime<Utc>, job_timeout: Duration) -> DateTime<Utc> {
    now - chrono::Duration::seconds((job_timeout.as_secs() * 2) as i64)
}

/// Re-fail jobs abandoned by a lost worker so their integrations do not
/// stay blocked by the claim's running-filter. Each goes through the normal
/// retry path and gets a lineage successor if attempts remain.
async fn reap_abandoned_jobs(
    conn: &mut AsyncPgConnection,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let cutoff = stale_cutoff(Utc::now(), config.worker.job_timeout);
    for job in db::sync_jobs::find_stale_running(conn, cutoff).await? {
        tracing::warn!(
            job_id = %job.id,
            integration_id = %job.integration_id,
            "re-failing job abandoned by a lost worker"
        );
        db::sync_jobs::mark_failed(
            conn,
            &job,
            "worker lost before completion",
            Some(default_backoff(job.attempt_count)),
            config.worker.max_attempts,
        )
        .await?;
    }
    Ok(())
}

fn failure_for_adapter(err: AdapterError, attempt_count: i32) -> JobFailure {
    match err {
        // By the time an AuthRejected reaches here the runner has already
        // burned its one mid-job refresh; the credentials are dead.
        AdapterError::AuthRejected => JobFailure {
            message: err.to_string(),
            retry: None,
            needs_reconnect: true,
        },
        AdapterError::RateLimited { retry_after_secs } => {
            JobFailure::retryable(err.to_string(), Duration::from_secs(retry_after_secs))
        }
        AdapterError::Transient(_) => {
            JobFailure::retryable(err.to_string(), default_backoff(attempt_count))
        }
        AdapterError::Malformed(_) => JobFailure::terminal(err.to_string()),
    }
}

fn failure_for_oauth(err: OAuthError, attempt_count: i32) -> JobFailure {
    match err {
        OAuthError::RefreshRejected(_) => JobFailure {
            message: err.to_string(),
            retry: None,
            needs_reconnect: true,
        },
        OAuthError::NotConfigured(_) | OAuthError::InvalidState(_) | OAuthError::ExchangeFailed(_) => {
            JobFailure::terminal(err.to_string())
        }
        OAuthError::Upstream(_) | OAuthError::Transport(_) | OAuthError::Database(_) => {
            JobFailure::retryable(err.to_string(), default_backoff(attempt_count))
        }
    }
}

fn failure_for_db(err: anyhow::Error, attempt_count: i32) -> JobFailure {
    JobFailure::retryable(format!("database error: {}", err), default_backoff(attempt_count))
}

/// Page through the provider's listing, upserting every record.
///
/// A mid-sweep `AuthRejected` triggers exactly one forced token refresh and
/// a retry of the same page; a second rejection bubbles out as terminal.
async fn run_sweep(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    adapter: &dyn SyncAdapter,
    integration: &Integration,
    attempt_count: i32,
) -> Result<usize, JobFailure> {
    let mut token = oauth::get_valid_access_token(http, config, conn, integration)
        .await
        .map_err(|e| failure_for_oauth(e, attempt_count))?;

    let mut cursor: Option<String> = None;
    let mut stored = 0usize;
    let mut refreshed_once = false;

    for page in 0..config.worker.max_pages {
        let result = adapter.fetch_batch(http, &token, cursor.as_deref()).await;
        let fetched = match result {
            Ok(page) => page,
            Err(AdapterError::AuthRejected) if !refreshed_once => {
                // Token rejected despite an unexpired expiry; refresh once
                // and retry this page.
                refreshed_once = true;
                token = oauth::refresh_and_persist(http, config, conn, integration)
                    .await
                    .map_err(|e| failure_for_oauth(e, attempt_count))?;
                continue;
            }
            Err(e) => return Err(failure_for_adapter(e, attempt_count)),
        };

        for entity in &fetched.entities {
            // One bad record must not sink the whole sweep.
            match db::entities::upsert(conn, integration, entity).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!(
                    integration_id = %integration.id,
                    native_id = %entity.native_id,
                    "skipping entity that failed to store: {:#}",
                    e
                ),
            }
        }

        cursor = fetched.next_cursor;
        if cursor.is_none() {
            return Ok(stored);
        }
        if page + 1 == config.worker.max_pages {
            tracing::warn!(
                integration_id = %integration.id,
                pages = config.worker.max_pages,
                "page limit reached mid-sweep, remainder left for the next sync"
            );
        }
    }

    Ok(stored)
}

/// Hinted rescan: fetch just the named record. `Ok(None)` means the adapter
/// has no narrow lookup and the caller should sweep instead.
async fn run_scoped_fetch(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    adapter: &dyn SyncAdapter,
    integration: &Integration,
    job: &SyncJobRow,
    hint: &str,
) -> Result<Option<usize>, JobFailure> {
    let token = oauth::get_valid_access_token(http, config, conn, integration)
        .await
        .map_err(|e| failure_for_oauth(e, job.attempt_count))?;

    let result = match adapter.fetch_scoped(http, &token, hint).await {
        Err(AdapterError::AuthRejected) => {
            let token = oauth::refresh_and_persist(http, config, conn, integration)
                .await
                .map_err(|e| failure_for_oauth(e, job.attempt_count))?;
            adapter.fetch_scoped(http, &token, hint).await
        }
        other => other,
    };

    let Some(entities) = result.map_err(|e| failure_for_adapter(e, job.attempt_count))? else {
        return Ok(None);
    };

    let mut stored = 0usize;
    for entity in &entities {
        match db::entities::upsert(conn, integration, entity).await {
            Ok(()) => stored += 1,
            Err(e) => tracing::warn!(
                integration_id = %integration.id,
                native_id = %entity.native_id,
                "skipping entity that failed to store: {:#}",
                e
            ),
        }
    }
    Ok(Some(stored))
}

/// Replay a stored webhook delivery through the adapter.
async fn run_webhook_event(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    adapter: &dyn SyncAdapter,
    integration: &Integration,
    job: &SyncJobRow,
) -> Result<usize, JobFailure> {
    let raw = job
        .payload
        .as_deref()
        .ok_or_else(|| JobFailure::terminal("webhook job has no payload".to_string()))?;

    let outcome = adapter
        .translate_webhook(raw.as_bytes())
        .map_err(|e| failure_for_adapter(e, job.attempt_count))?;

    match outcome {
        WebhookOutcome::Entities(entities) => {
            let mut stored = 0usize;
            for entity in &entities {
                match db::entities::upsert(conn, integration, entity).await {
                    Ok(()) => stored += 1,
                    Err(e) => tracing::warn!(
                        integration_id = %integration.id,
                        native_id = %entity.native_id,
                        "skipping entity that failed to store: {:#}",
                        e
                    ),
                }
            }
            Ok(stored)
        }
        WebhookOutcome::Rescan(request) => {
            // Notification-only payload: fetch instead. A hint narrows the
            // fetch to the named record when the provider supports it.
            if let Some(hint) = &request.hint {
                if let Some(stored) =
                    run_scoped_fetch(http, config, conn, adapter, integration, job, hint).await?
                {
                    return Ok(stored);
                }
            }
            run_sweep(http, config, conn, adapter, integration, job.attempt_count).await
        }
    }
}

async fn process_job(
    http: &reqwest::Client,
    config: &AppConfig,
    conn: &mut AsyncPgConnection,
    job: &SyncJobRow,
) -> Result<usize, JobFailure> {
    let integration = db::integrations::get_by_id(conn, job.integration_id)
        .await
        .map_err(|e| failure_for_db(e, job.attempt_count))?
        .filter(|i| i.is_active)
        .ok_or_else(|| JobFailure::terminal("integration missing or disconnected".to_string()))?;

    let provider = integration
        .provider()
        .map_err(JobFailure::terminal)?;
    let adapter = adapter_for(provider);

    let kind = job.kind().map_err(JobFailure::terminal)?;
    let stored = match kind {
        JobKind::FullSync | JobKind::IncrementalSync => {
            run_sweep(http, config, conn, adapter, &integration, job.attempt_count).await?
        }
        JobKind::WebhookEvent => {
            run_webhook_event(http, config, conn, adapter, &integration, job).await?
        }
    };

    db::integrations::update_last_synced(conn, integration.id)
        .await
        .map_err(|e| failure_for_db(e, job.attempt_count))?;

    Ok(stored)
}

/// Claim and execute jobs until the queue has nothing eligible.
pub async fn drain_queue(
    pool: &DbPool,
    config: &AppConfig,
    http: &reqwest::Client,
) -> anyhow::Result<ProcessJobsResponse> {
    let mut stats = ProcessJobsResponse {
        processed: 0,
        succeeded: 0,
        failed: 0,
    };

    {
        let mut conn = pool.get().await?;
        reap_abandoned_jobs(&mut conn, config).await?;
    }

    loop {
        let mut conn = pool.get().await?;
        let Some(job) = db::sync_jobs::claim_next(&mut conn).await? else {
            break;
        };
        stats.processed += 1;

        let outcome =
            tokio::time::timeout(config.worker.job_timeout, process_job(http, config, &mut conn, &job))
                .await;

        match outcome {
            Ok(Ok(stored)) => {
                db::sync_jobs::mark_succeeded(&mut conn, job.id).await?;
                stats.succeeded += 1;
                tracing::info!(
                    job_id = %job.id,
                    integration_id = %job.integration_id,
                    kind = %job.kind,
                    stored,
                    "sync job succeeded"
                );
            }
            Ok(Err(failure)) => {
                let successor = db::sync_jobs::mark_failed(
                    &mut conn,
                    &job,
                    &failure.message,
                    failure.retry,
                    config.worker.max_attempts,
                )
                .await?;
                if failure.needs_reconnect {
                    db::integrations::flag_reconnect(&mut conn, job.integration_id).await?;
                }
                stats.failed += 1;
                tracing::warn!(
                    job_id = %job.id,
                    integration_id = %job.integration_id,
                    error = %failure.message,
                    retry_scheduled = successor.is_some(),
                    "sync job failed"
                );
            }
            Err(_) => {
                let message = format!(
                    "job timed out after {}s",
                    config.worker.job_timeout.as_secs()
                );
                db::sync_jobs::mark_failed(
                    &mut conn,
                    &job,
                    &message,
                    Some(default_backoff(job.attempt_count)),
                    config.worker.max_attempts,
                )
                .await?;
                stats.failed += 1;
                tracing::warn!(job_id = %job.id, "{}", message);
            }
        }
    }

    Ok(stats)
}

/// Long-running worker loop: polls the queue on an interval and drains it.
pub async fn start_sync_worker(pool: DbPool, config: Arc<AppConfig>, http: reqwest::Client) {
    let mut ticker = tokio::time::interval(config.worker.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(
        poll_interval_secs = config.worker.poll_interval.as_secs(),
        "sync worker started"
    );

    loop {
        ticker.tick().await;
        match drain_queue(&pool, &config, &http).await {
            Ok(stats) if stats.processed > 0 => {
                tracing::info!(
                    processed = stats.processed,
                    succeeded = stats.succeeded,
                    failed = stats.failed,
                    "queue drained"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("queue drain errored: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(default_backoff(0), Duration::from_secs(30));
        assert_eq!(default_backoff(1), Duration::from_secs(60));
        assert_eq!(default_backoff(2), Duration::from_secs(120));
        // Clamped so a runaway attempt count cannot overflow.
        assert_eq!(default_backoff(100), default_backoff(10));
    }

    #[test]
    fn stale_cutoff_trails_the_job_timeout() {
        let now = Utc::now();
        let timeout = Duration::from_secs(120);
        let cutoff = stale_cutoff(now, timeout);
        // A job still inside its timeout window must never look abandoned.
        assert!(cutoff < now - chrono::Duration::seconds(120));
        assert_eq!(now - cutoff, chrono::Duration::seconds(240));
    }

    #[test]
    fn rate_limit_uses_provider_delay() {
        let failure = failure_for_adapter(
            AdapterError::RateLimited {
                retry_after_secs: 17,
            },
            2,
        );
        assert_eq!(failure.retry, Some(Duration::from_secs(17)));
        assert!(!failure.needs_reconnect);
    }

    #[test]
    fn transient_uses_backoff() {
        let failure = failure_for_adapter(AdapterError::Transient("503".to_string()), 1);
        assert_eq!(failure.retry, Some(Duration::from_secs(60)));
    }

    #[test]
    fn malformed_is_terminal() {
        let failure = failure_for_adapter(AdapterError::Malformed("drift".to_string()), 0);
        assert_eq!(failure.retry, None);
        assert!(!failure.needs_reconnect);
    }

    #[test]
    fn auth_rejection_is_terminal_and_flags_reconnect() {
        let failure = failure_for_adapter(AdapterError::AuthRejected, 0);
        assert_eq!(failure.retry, None);
        assert!(failure.needs_reconnect);
    }

    #[test]
    fn refresh_rejection_flags_reconnect() {
        let failure =
            failure_for_oauth(OAuthError::RefreshRejected("revoked".to_string()), 0);
        assert_eq!(failure.retry, None);
        assert!(failure.needs_reconnect);
    }

    #[test]
    fn upstream_oauth_trouble_is_retryable() {
        let failure = failure_for_oauth(OAuthError::Upstream("502".to_string()), 0);
        assert_eq!(failure.retry, Some(Duration::from_secs(30)));
        assert!(!failure.needs_reconnect);
    }
}
