//! Application configuration loaded from environment variables.

use anyhow::{Context, Result};
use shared_types::Provider;
use std::env;
use std::time::Duration;

/// OAuth client credentials and webhook secret for one provider.
///
/// Providers without credentials configured simply cannot be connected;
/// the rest of the engine keeps working.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: Option<String>,
}

/// Knobs for the background job runner.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often a worker polls the queue for claimable jobs
    pub poll_interval: Duration,
    /// Per-job execution timeout; an overrun fails the job (retryable)
    pub job_timeout: Duration,
    /// Page-count safety limit per fetch sweep
    pub max_pages: u32,
    /// Retry ceiling: a job that fails this many times stays failed
    pub max_attempts: i32,
}

impl WorkerConfig {
    fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_parse("SYNC_POLL_INTERVAL_SECS", 30)),
            job_timeout: Duration::from_secs(env_parse("SYNC_JOB_TIMEOUT_SECS", 120)),
            max_pages: env_parse("SYNC_MAX_PAGES", 20),
            max_attempts: env_parse("SYNC_MAX_ATTEMPTS", 3),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Externally reachable base URL, used to build OAuth redirect URIs
    pub public_base_url: String,
    pub jwt_secret: String,
    /// Secret for signing OAuth `state` tokens; falls back to the JWT secret
    pub state_secret: String,
    /// Shared-secret bearer token guarding /internal/process-jobs
    pub internal_api_token: String,
    pub worker: WorkerConfig,
    zoom: Option<ProviderCredentials>,
    linear: Option<ProviderCredentials>,
    slack: Option<ProviderCredentials>,
    dropbox: Option<ProviderCredentials>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let state_secret = env::var("STATE_SECRET").unwrap_or_else(|_| jwt_secret.clone());

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            jwt_secret,
            state_secret,
            internal_api_token: env::var("INTERNAL_API_TOKEN")
                .context("INTERNAL_API_TOKEN must be set")?,
            worker: WorkerConfig::from_env(),
            zoom: provider_credentials_from_env("ZOOM"),
            linear: provider_credentials_from_env("LINEAR"),
            slack: provider_credentials_from_env("SLACK"),
            dropbox: provider_credentials_from_env("DROPBOX"),
        })
    }

    /// Credentials for a provider, if that provider is configured.
    pub fn credentials(&self, provider: Provider) -> Option<&ProviderCredentials> {
        match provider {
            Provider::Zoom => self.zoom.as_ref(),
            Provider::Linear => self.linear.as_ref(),
            Provider::Slack => self.slack.as_ref(),
            Provider::Dropbox => self.dropbox.as_ref(),
        }
    }

    /// The OAuth callback URI registered with every provider.
    pub fn oauth_redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.public_base_url.trim_end_matches('/'))
    }
}

fn provider_credentials_from_env(prefix: &str) -> Option<ProviderCredentials> {
    let client_id = env::var(format!("{}_CLIENT_ID", prefix)).ok()?;
    let client_secret = env::var(format!("{}_CLIENT_SECRET", prefix)).ok()?;
    Some(ProviderCredentials {
        client_id,
        client_secret,
        webhook_secret: env::var(format!("{}_WEBHOOK_SECRET", prefix)).ok(),
    })
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
