//! HTTP handlers for the owner-facing API and the internal drain endpoint.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Redirect;
use axum::{Extension, Json};
use serde::Deserialize;
use shared_types::{
    EnqueuedJobResponse, IntegrationResponse, JobKind, ProcessJobsResponse, Provider,
    SyncJobResponse, SyncNowRequest,
};
use uuid::Uuid;

use crate::adapters::adapter_for;
use crate::auth::{internal_token_matches, AuthOwner};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::oauth;
use crate::runner;
use crate::AppState;

const JOB_LIST_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub provider: String,
}

/// GET /oauth/authorize?provider=P — redirect the owner to provider consent.
pub async fn oauth_authorize(
    State(state): State<AppState>,
    Extension(AuthOwner(owner_id)): Extension<AuthOwner>,
    Query(params): Query<AuthorizeParams>,
) -> ApiResult<Redirect> {
    let provider: Provider = params
        .provider
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown provider: {}", params.provider)))?;

    let (url, _state) = oauth::build_authorization_url(&state.config, provider, owner_id)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn callback_error(detail: &str) -> Redirect {
    Redirect::temporary(&format!(
        "/integrations?error={}",
        urlencoding::encode(detail)
    ))
}

/// GET /oauth/callback — the provider redirects here after consent.
///
/// Every failure path redirects back to the integrations page with an error
/// flag; the browser is mid-redirect-chain and cannot render a JSON error.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    if let Some(e) = params.error {
        return callback_error(&format!("provider declined: {}", e));
    }
    let (Some(code), Some(state_token)) = (params.code, params.state) else {
        return callback_error("missing code or state");
    };

    let claims = match oauth::decode_state(&state.config.state_secret, &state_token, chrono::Utc::now())
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("rejected oauth callback: {}", e);
            return callback_error("invalid state");
        }
    };

    let tokens = match oauth::exchange_code(&state.http, &state.config, claims.provider, &code).await
    {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(provider = %claims.provider, "code exchange failed: {}", e);
            return callback_error("token exchange failed");
        }
    };

    // Some token responses carry the account id; otherwise ask the provider.
    let account_id = match tokens.account_id.clone() {
        Some(id) => id,
        None => {
            match adapter_for(claims.provider)
                .account_id(&state.http, &tokens.access_token)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(provider = %claims.provider, "account lookup failed: {}", e);
                    return callback_error("account lookup failed");
                }
            }
        }
    };

    let mut conn = match state.pool.get().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("connection pool error: {}", e);
            return callback_error("temporarily unavailable");
        }
    };

    let connected = db::integrations::connect(
        &mut conn,
        claims.owner_id,
        claims.provider,
        &tokens.access_token,
        tokens.refresh_token.as_deref(),
        tokens.expires_at(),
        &account_id,
    )
    .await;

    let integration = match connected {
        Ok(i) => i,
        Err(e) => {
            tracing::error!("failed to store integration: {:#}", e);
            return callback_error("failed to store integration");
        }
    };

    if let Err(e) =
        db::sync_jobs::enqueue(&mut conn, integration.id, JobKind::FullSync, None).await
    {
        // The connection itself succeeded; the owner can trigger a sync
        // manually.
        tracing::error!(integration_id = %integration.id, "failed to enqueue initial sync: {:#}", e);
    }

    tracing::info!(
        integration_id = %integration.id,
        provider = %claims.provider,
        "integration connected"
    );
    Redirect::temporary(&format!("/integrations?connected={}", claims.provider))
}

/// GET /integrations — the caller's integrations, tokens redacted.
pub async fn list_integrations(
    State(state): State<AppState>,
    Extension(AuthOwner(owner_id)): Extension<AuthOwner>,
) -> ApiResult<Json<Vec<IntegrationResponse>>> {
    let mut conn = state.pool.get().await?;
    let rows = db::integrations::list_for_owner(&mut conn, owner_id).await?;

    Ok(Json(rows.into_iter().map(IntegrationResponse::from).collect()))
}

/// DELETE /integrations/:id — soft disconnect.
pub async fn disconnect_integration(
    State(state): State<AppState>,
    Extension(AuthOwner(owner_id)): Extension<AuthOwner>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<IntegrationResponse>> {
    let mut conn = state.pool.get().await?;

    let integration = db::integrations::get_by_id(&mut conn, id)
        .await?
        // A foreign id gets the same 404 as a missing one.
        .filter(|i| i.owner_id == owner_id)
        .ok_or_else(|| ApiError::not_found("integration"))?;

    let updated = db::integrations::deactivate(&mut conn, integration.id).await?;
    tracing::info!(integration_id = %id, "integration disconnected");

    Ok(Json(IntegrationResponse::from(updated)))
}

/// POST /sync — enqueue an incremental sync for one of the caller's
/// integrations.
pub async fn sync_now(
    State(state): State<AppState>,
    Extension(AuthOwner(owner_id)): Extension<AuthOwner>,
    Json(request): Json<SyncNowRequest>,
) -> ApiResult<Json<EnqueuedJobResponse>> {
    let mut conn = state.pool.get().await?;

    let integration = db::integrations::get_by_id(&mut conn, request.integration_id)
        .await?
        .filter(|i| i.owner_id == owner_id && i.is_active)
        .ok_or_else(|| ApiError::not_found("integration"))?;

    let job =
        db::sync_jobs::enqueue(&mut conn, integration.id, JobKind::IncrementalSync, None).await?;

    Ok(Json(EnqueuedJobResponse { job_id: job.id }))
}

#[derive(Debug, Deserialize)]
pub struct JobListParams {
    pub integration_id: Uuid,
}

/// GET /sync/jobs?integration_id= — recent jobs for one integration.
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(AuthOwner(owner_id)): Extension<AuthOwner>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Json<Vec<SyncJobResponse>>> {
    let mut conn = state.pool.get().await?;

    db::integrations::get_by_id(&mut conn, params.integration_id)
        .await?
        .filter(|i| i.owner_id == owner_id)
        .ok_or_else(|| ApiError::not_found("integration"))?;

    let rows = db::sync_jobs::list_recent(&mut conn, params.integration_id, JOB_LIST_LIMIT).await?;

    Ok(Json(rows.into_iter().map(SyncJobResponse::from).collect()))
}

/// POST /internal/process-jobs — drain the queue once. Guarded by the
/// internal shared-secret token, for deployments that trigger processing
/// externally instead of running the worker loop.
pub async fn process_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ProcessJobsResponse>> {
    if !internal_token_matches(&headers, &state.config.internal_api_token) {
        return Err(ApiError::Unauthorized("invalid internal token".to_string()));
    }

    let stats = runner::drain_queue(&state.pool, &state.config, &state.http).await?;
    Ok(Json(stats))
}
