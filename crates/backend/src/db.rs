use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection, RunQueryDsl,
};
use shared_types::Integration;
use uuid::Uuid;

pub type DbPool = Pool<AsyncPgConnection>;

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    // Set up rustls TLS configuration
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    // Parse the connection string and connect with TLS
    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    // Spawn the connection task
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    // Build the async connection from the tokio-postgres client
    AsyncPgConnection::try_from(client).await
}

pub fn establish_connection_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup =
        Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
        database_url.to_string(),
        manager_config,
    );
    let pool = Pool::builder(config).build()?;

    Ok(pool)
}

// Integration (credential store) database operations.
//
// Token fields are written only through `persist_tokens_if_unchanged`, called
// from the OAuth broker; everything else treats them as read-only.
pub mod integrations {
    use super::*;
    use crate::models::NewIntegration;
    use shared_types::Provider;

    pub async fn get_by_id(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
    ) -> anyhow::Result<Option<Integration>> {
        use crate::schema::integrations::dsl::*;

        let row = integrations
            .filter(id.eq(integration_id))
            .first::<Integration>(conn)
            .await
            .optional()?;

        Ok(row)
    }

    pub async fn list_for_owner(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
    ) -> anyhow::Result<Vec<Integration>> {
        use crate::schema::integrations::dsl::*;

        let rows = integrations
            .filter(owner_id.eq(owner))
            .order_by(created_at.desc())
            .load::<Integration>(conn)
            .await?;

        Ok(rows)
    }

    pub async fn list_active_by_provider(
        conn: &mut AsyncPgConnection,
        provider_val: Provider,
    ) -> anyhow::Result<Vec<Integration>> {
        use crate::schema::integrations::dsl::*;

        let rows = integrations
            .filter(provider.eq(provider_val.as_str()))
            .filter(is_active.eq(true))
            .load::<Integration>(conn)
            .await?;

        Ok(rows)
    }

    /// Active integrations whose provider-side account/team id matches one a
    /// webhook payload named.
    pub async fn find_active_by_accounts(
        conn: &mut AsyncPgConnection,
        provider_val: Provider,
        account_ids: &[String],
    ) -> anyhow::Result<Vec<Integration>> {
        use crate::schema::integrations::dsl::*;

        let rows = integrations
            .filter(provider.eq(provider_val.as_str()))
            .filter(is_active.eq(true))
            .filter(external_account_id.eq_any(account_ids))
            .load::<Integration>(conn)
            .await?;

        Ok(rows)
    }

    /// Create or revive the integration for (owner, provider).
    ///
    /// At most one row exists per (owner, provider): reconnecting a provider
    /// updates the existing row in place and reactivates it.
    pub async fn connect(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        provider_val: Provider,
        access_token_val: &str,
        refresh_token_val: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        account_id_val: &str,
    ) -> anyhow::Result<Integration> {
        use crate::schema::integrations::dsl::*;

        let existing = integrations
            .filter(owner_id.eq(owner))
            .filter(provider.eq(provider_val.as_str()))
            .first::<Integration>(conn)
            .await
            .optional()?;

        let row = match existing {
            Some(found) => {
                diesel::update(integrations.filter(id.eq(found.id)))
                    .set((
                        access_token.eq(access_token_val),
                        refresh_token.eq(refresh_token_val),
                        token_expires_at.eq(expires_at),
                        external_account_id.eq(account_id_val),
                        needs_reconnect.eq(false),
                        is_active.eq(true),
                        updated_at.eq(Utc::now()),
                    ))
                    .get_result::<Integration>(conn)
                    .await?
            }
            None => {
                let now = Utc::now();
                diesel::insert_into(integrations)
                    .values(NewIntegration {
                        id: Uuid::new_v4(),
                        owner_id: owner,
                        provider: provider_val.as_str().to_string(),
                        access_token: access_token_val.to_string(),
                        refresh_token: refresh_token_val.map(|s| s.to_string()),
                        token_expires_at: expires_at,
                        external_account_id: account_id_val.to_string(),
                        webhook_state: "unregistered".to_string(),
                        needs_reconnect: false,
                        is_active: true,
                        created_at: now,
                        updated_at: now,
                    })
                    .get_result::<Integration>(conn)
                    .await?
            }
        };

        Ok(row)
    }

    /// Write a refreshed token tuple, guarded by an optimistic check on the
    /// access token read earlier. Returns false when another refresh won the
    /// race; the caller should re-read the row and use the winner's token.
    pub async fn persist_tokens_if_unchanged(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
        token_read: &str,
        new_access_token: &str,
        new_refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        use crate::schema::integrations::dsl::*;

        let updated = diesel::update(
            integrations
                .filter(id.eq(integration_id))
                .filter(access_token.eq(token_read)),
        )
        .set((
            access_token.eq(new_access_token),
            refresh_token.eq(new_refresh_token),
            token_expires_at.eq(expires_at),
            updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

        Ok(updated == 1)
    }

    /// Flag an integration as needing user reconnection (revoked consent).
    /// The integration stays active so the UI can surface the state.
    pub async fn flag_reconnect(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
    ) -> anyhow::Result<()> {
        use crate::schema::integrations::dsl::*;

        diesel::update(integrations.filter(id.eq(integration_id)))
            .set((needs_reconnect.eq(true), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn update_last_synced(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
    ) -> anyhow::Result<()> {
        use crate::schema::integrations::dsl::*;

        diesel::update(integrations.filter(id.eq(integration_id)))
            .set((last_synced_at.eq(Some(Utc::now())), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn set_webhook_state(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
        state: &str,
    ) -> anyhow::Result<()> {
        use crate::schema::integrations::dsl::*;

        diesel::update(integrations.filter(id.eq(integration_id)))
            .set((webhook_state.eq(state), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Soft delete on user disconnect.
    pub async fn deactivate(
        conn: &mut AsyncPgConnection,
        integration_id: Uuid,
    ) -> anyhow::Result<Integration> {
        use crate::schema::integrations::dsl::*;

        let updated = diesel::update(integrations.filter(id.eq(integration_id)))
            .set((is_active.eq(false), updated_at.eq(Utc::now())))
            .get_result::<Integration>(conn)
            .await?;

        Ok(updated)
    }
}

// Sync job (durable queue) database operations.
//
// The queue owns sync_jobs rows exclusively; status, attempt and error fields
// are written only here. Rows never regress from a terminal state: retries
// are inserted as lineage successors.
pub mod sync_jobs {
    use super::*;
    use crate::models::{NewSyncJob, SyncJobRow};
    use shared_types::JobKind;
    use std::time::Duration;

    pub async fn enqueue(
        conn: &mut AsyncPgConnection,
        integration: Uuid,
        kind_val: JobKind,
        payload_val: Option<String>,
    ) -> anyhow::Result<SyncJobRow> {
        use crate::schema::sync_jobs::dsl::*;

        let job = diesel::insert_into(sync_jobs)
            .values(NewSyncJob {
                id: Uuid::new_v4(),
                integration_id: integration,
                kind: kind_val.as_str().to_string(),
                status: "pending".to_string(),
                payload: payload_val,
                attempt_count: 0,
                lineage: 0,
                not_before: None,
                created_at: Utc::now(),
            })
            .get_result::<SyncJobRow>(conn)
            .await?;

        Ok(job)
    }

    /// One statement, three concurrency guards: `FOR UPDATE SKIP LOCKED`
    /// keeps two workers off the same row, the `NOT IN` subquery keeps a
    /// second job of an integration from starting once one is committed
    /// running, and the transaction-scoped advisory lock (keyed on the
    /// integration id) closes the snapshot window between those two — a
    /// worker whose claim of the same integration is still in flight holds
    /// the lock, so the second worker's candidate is filtered out.
    pub(crate) const CLAIM_SQL: &str = r#"
        UPDATE sync_jobs
        SET status = 'running', started_at = NOW()
        WHERE id = (
            SELECT id FROM sync_jobs
            WHERE status = 'pending'
              AND (not_before IS NULL OR not_before <= NOW())
              AND integration_id NOT IN (
                  SELECT integration_id FROM sync_jobs WHERE status = 'running'
              )
              AND pg_try_advisory_xact_lock(hashtextextended(integration_id::text, 0))
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        AND status = 'pending'
        RETURNING id, integration_id, kind, status, payload, attempt_count, lineage,
                  not_before, created_at, started_at, completed_at, last_error
    "#;

    /// Atomically claim the oldest eligible pending job.
    ///
    /// Eligible means: due (`not_before` passed) and no job of the same
    /// integration currently running. A worker that loses any of the claim
    /// races simply gets no row back; the job stays pending for the next
    /// poll.
    pub async fn claim_next(conn: &mut AsyncPgConnection) -> anyhow::Result<Option<SyncJobRow>> {
        let claimed = diesel::sql_query(CLAIM_SQL)
            .get_result::<SyncJobRow>(conn)
            .await
            .optional()?;

        Ok(claimed)
    }

    /// Jobs still marked `running` whose worker started them before the
    /// cutoff. A worker that dies between claiming and marking leaves such a
    /// row behind, and the claim's running-filter would otherwise block that
    /// integration forever; the runner re-fails these through `mark_failed`
    /// at the start of every drain.
    pub async fn find_stale_running(
        conn: &mut AsyncPgConnection,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SyncJobRow>> {
        use crate::schema::sync_jobs::dsl::*;

        let rows = sync_jobs
            .filter(status.eq("running"))
            .filter(started_at.lt(cutoff))
            .load::<SyncJobRow>(conn)
            .await?;

        Ok(rows)
    }

    pub async fn mark_succeeded(
        conn: &mut AsyncPgConnection,
        job_id: Uuid,
    ) -> anyhow::Result<()> {
        use crate::schema::sync_jobs::dsl::*;

        diesel::update(sync_jobs.filter(id.eq(job_id)).filter(status.eq("running")))
            .set((status.eq("succeeded"), completed_at.eq(Some(Utc::now()))))
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Terminally fail a running job and, when a retry delay is given and the
    /// attempt ceiling not yet reached, insert its lineage successor.
    ///
    /// The successor keeps the original `created_at` so it stays logically
    /// oldest in the FIFO order, and carries the incremented attempt count.
    pub async fn mark_failed(
        conn: &mut AsyncPgConnection,
        job: &SyncJobRow,
        error: &str,
        retry_after: Option<Duration>,
        max_attempts: i32,
    ) -> anyhow::Result<Option<SyncJobRow>> {
        use crate::schema::sync_jobs::dsl::*;

        diesel::update(sync_jobs.filter(id.eq(job.id)).filter(status.eq("running")))
            .set((
                status.eq("failed"),
                completed_at.eq(Some(Utc::now())),
                last_error.eq(Some(error)),
                attempt_count.eq(job.attempt_count + 1),
            ))
            .execute(conn)
            .await?;

        let attempts = job.attempt_count + 1;
        let successor = match retry_after {
            Some(delay) if attempts < max_attempts => {
                let row = diesel::insert_into(sync_jobs)
                    .values(NewSyncJob {
                        id: Uuid::new_v4(),
                        integration_id: job.integration_id,
                        kind: job.kind.clone(),
                        status: "pending".to_string(),
                        payload: job.payload.clone(),
                        attempt_count: attempts,
                        lineage: job.lineage + 1,
                        not_before: Some(Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64)),
                        created_at: job.created_at,
                    })
                    .get_result::<SyncJobRow>(conn)
                    .await?;
                Some(row)
            }
            _ => None,
        };

        Ok(successor)
    }

    pub async fn list_recent(
        conn: &mut AsyncPgConnection,
        integration: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<SyncJobRow>> {
        use crate::schema::sync_jobs::dsl::*;

        let rows = sync_jobs
            .filter(integration_id.eq(integration))
            .order_by(created_at.desc())
            .then_order_by(lineage.desc())
            .limit(limit)
            .load::<SyncJobRow>(conn)
            .await?;

        Ok(rows)
    }
}

// Synced entity storage: idempotent upsert by natural key.
pub mod entities {
    use super::*;
    use crate::models::NewSyncedEntity;
    use diesel::upsert::excluded;
    use shared_types::NormalizedEntity;

    /// Upsert one normalized entity keyed by (owner, provider, native_id).
    /// Re-ingesting the same native id updates the stored record in place.
    pub async fn upsert(
        conn: &mut AsyncPgConnection,
        integration: &Integration,
        entity: &NormalizedEntity,
    ) -> anyhow::Result<()> {
        use crate::schema::synced_entities::dsl::*;

        let now = Utc::now();
        diesel::insert_into(synced_entities)
            .values(NewSyncedEntity {
                id: Uuid::new_v4(),
                owner_id: integration.owner_id,
                integration_id: integration.id,
                provider: integration.provider.clone(),
                native_id: entity.native_id.clone(),
                kind: entity.kind.as_str().to_string(),
                payload: serde_json::to_string(&entity.payload)?,
                source_timestamp: entity.source_timestamp,
                first_seen_at: now,
                updated_at: now,
            })
            .on_conflict((owner_id, provider, native_id))
            .do_update()
            .set((
                integration_id.eq(excluded(integration_id)),
                kind.eq(excluded(kind)),
                payload.eq(excluded(payload)),
                source_timestamp.eq(excluded(source_timestamp)),
                updated_at.eq(excluded(updated_at)),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::sync_jobs::CLAIM_SQL;

    // The claim must stay one atomic statement carrying all three guards;
    // losing any of them reopens a double-claim or same-integration race.
    #[test]
    fn claim_statement_keeps_its_concurrency_guards() {
        assert!(!CLAIM_SQL.trim().trim_end_matches(';').contains(';'));
        assert!(CLAIM_SQL.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_SQL.contains("status = 'running'"));
        assert!(CLAIM_SQL.contains("pg_try_advisory_xact_lock"));
        assert!(CLAIM_SQL.contains("AND status = 'pending'"));
    }
}
