//! OAuth2 client-credentials token acquisition
//!
//! The broker transport authenticates either with a plain password or with a
//! short-lived bearer token obtained here. Tokens are cached until shortly
//! before their server-declared expiry; refresh is lazy, never periodic.

use crate::error::{SupervisorError, SupervisorResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Safety margin subtracted from the server-declared expiry so a token is
/// never presented right at its expiry instant
const REDUCE_VALID_UNTIL_BY_SECS: i64 = 10;

/// Bounded timeout for the token endpoint round trip
const TOKEN_TIMEOUT_SECS: u64 = 10;

/// Client-credentials grant configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    pub auth_server_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub audience: String,
}

impl TokenConfig {
    fn validate(&self) -> SupervisorResult<()> {
        let fields = [
            ("auth_server_url", &self.auth_server_url),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("scope", &self.scope),
            ("audience", &self.audience),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(SupervisorError::configuration(format!(
                    "token config field '{name}' cannot be empty"
                )));
            }
        }
        url::Url::parse(&self.auth_server_url).map_err(|e| {
            SupervisorError::configuration(format!(
                "invalid auth_server_url '{}': {e}",
                self.auth_server_url
            ))
        })?;
        Ok(())
    }
}

/// Time source, injectable for deterministic cache tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct TokenInfo {
    token: String,
    valid_until: DateTime<Utc>,
}

/// Acquires and caches an OAuth2 client-credentials access token
pub struct TokenProvider {
    config: TokenConfig,
    http: reqwest::Client,
    cached: Mutex<Option<TokenInfo>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// Fails fast with a configuration error when any required field is
    /// missing
    pub fn new(config: TokenConfig) -> SupervisorResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TokenConfig, clock: Arc<dyn Clock>) -> SupervisorResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TOKEN_TIMEOUT_SECS))
            .build()
            .map_err(|e| SupervisorError::configuration(format!("http client: {e}")))?;
        Ok(Self {
            config,
            http,
            cached: Mutex::new(None),
            clock,
        })
    }

    /// Return the cached token, refreshing first when absent or expired.
    ///
    /// The cache lock is held across the refresh so concurrent callers issue
    /// at most one request against the authorization server.
    pub async fn get(&self) -> SupervisorResult<String> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();
        match cached.as_ref() {
            Some(info) if info.valid_until > now => Ok(info.token.clone()),
            _ => {
                let info = self.refresh(now).await?;
                let token = info.token.clone();
                *cached = Some(info);
                Ok(token)
            }
        }
    }

    async fn refresh(&self, now: DateTime<Utc>) -> SupervisorResult<TokenInfo> {
        debug!(endpoint = %self.config.auth_server_url, "refreshing access token");
        let response = self
            .http
            .post(&self.config.auth_server_url)
            .header(reqwest::header::CONNECTION, "close")
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", self.config.scope.as_str()),
                ("audience", self.config.audience.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SupervisorError::token_acquisition(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SupervisorError::token_acquisition(format!("endpoint rejected: {e}")))?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SupervisorError::token_acquisition(format!("undecodable response: {e}")))?;

        let valid_until =
            now + Duration::seconds(token.expires_in - REDUCE_VALID_UNTIL_BY_SECS);
        Ok(TokenInfo {
            token: token.access_token,
            valid_until,
        })
    }
}
