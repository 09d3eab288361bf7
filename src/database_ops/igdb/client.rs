use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::error::{FetchStage, RemoteFetchError};
use super::kinds::EntityKind;
use super::query::{count_query, page_query};
use super::record::ExternalRecord;
use super::source::{RemoteSource, MAX_PAGE_SIZE};
use crate::util::env::{env_opt, env_parse};

const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const IGDB_API_BASE: &str = "https://api.igdb.com/v4";

#[derive(Debug, Clone)]
pub struct IgdbConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Pre-issued bearer token; skips the client-credentials exchange when set.
    pub access_token: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl IgdbConfig {
    pub fn from_env() -> Result<Self> {
        let client_id = env_opt("TWITCH_CLIENT_ID")
            .context("missing env: TWITCH_CLIENT_ID (required for IGDB)")?;
        let client_secret = env_opt("TWITCH_CLIENT_SECRET");
        let access_token = env_opt("IGDB_ACCESS_TOKEN");
        if client_secret.is_none() && access_token.is_none() {
            anyhow::bail!("set TWITCH_CLIENT_SECRET or IGDB_ACCESS_TOKEN to authenticate against IGDB");
        }
        Ok(Self {
            base_url: env_opt("IGDB_BASE_URL").unwrap_or_else(|| IGDB_API_BASE.to_string()),
            token_url: env_opt("TWITCH_TOKEN_URL").unwrap_or_else(|| TWITCH_TOKEN_URL.to_string()),
            client_id,
            client_secret,
            access_token,
            user_agent: env_opt("IGDB_USER_AGENT")
                .unwrap_or_else(|| "patchnote-sync-igdb-import/1.0".to_string()),
            timeout_secs: env_parse("IGDB_TIMEOUT_SECS", 30u64),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct IgdbToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// HTTP implementation of [`RemoteSource`] against the IGDB v4 API.
pub struct IgdbClient {
    cfg: IgdbConfig,
    http: Client,
    token: Arc<Mutex<Option<IgdbToken>>>,
}

impl IgdbClient {
    pub fn new(cfg: IgdbConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to construct IGDB HTTP client")?;
        let token = cfg.access_token.clone().map(|access_token| IgdbToken {
            access_token,
            // Static tokens are trusted until IGDB answers 401.
            expires_at: Instant::now() + Duration::from_secs(365 * 24 * 3600),
        });
        Ok(Self {
            cfg,
            http,
            token: Arc::new(Mutex::new(token)),
        })
    }

    pub fn new_from_env() -> Result<Self> {
        Self::new(IgdbConfig::from_env()?)
    }

    async fn ensure_token(&self) -> Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(30) {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let token = self.request_new_token().await?;
        let mut guard = self.token.lock().await;
        *guard = Some(token.clone());
        Ok(token.access_token)
    }

    async fn request_new_token(&self) -> Result<IgdbToken> {
        let client_secret = self
            .cfg
            .client_secret
            .as_deref()
            .context("IGDB token expired and no TWITCH_CLIENT_SECRET is configured")?;
        let response = self
            .http
            .post(&self.cfg.token_url)
            .query(&[
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", client_secret),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("requesting Twitch OAuth token")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("twitch token request failed (status={}): {}", status, text);
        }
        let token: TwitchTokenResponse = response.json().await?;
        let ttl = token.expires_in.saturating_sub(30).max(30);
        Ok(IgdbToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }

    /// Sends one Apicalypse body. A 401 drops the cached token and is retried once
    /// with a fresh one; every other failure is returned to the caller.
    async fn execute<T>(
        &self,
        path: &str,
        body: String,
        kind: EntityKind,
        stage: FetchStage,
        offset: u64,
    ) -> Result<T, RemoteFetchError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path);
        let fail = |msg: String| RemoteFetchError::new(kind, stage, offset, msg);
        let mut refreshed = false;
        loop {
            let token = self
                .ensure_token()
                .await
                .map_err(|e| fail(format!("authentication failed: {e:#}")))?;
            let response = self
                .http
                .post(&url)
                .header("Client-ID", &self.cfg.client_id)
                .header("Content-Type", "text/plain")
                .header("Authorization", format!("Bearer {}", token))
                .body(body.clone())
                .send()
                .await
                .map_err(|e| fail(format!("transport error: {e}")).retryable())?;

            let status = response.status();
            if status.is_success() {
                let text = response
                    .text()
                    .await
                    .map_err(|e| fail(format!("reading body: {e}")).retryable())?;
                return serde_json::from_str(&text).map_err(|err| {
                    fail(format!("malformed IGDB payload ({err}): {}", truncate(&text, 300)))
                });
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                *self.token.lock().await = None;
                refreshed = true;
                debug!(target = "igdb", %kind, "IGDB token rejected; refreshing");
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            let err = fail(format!("status={} body={}", status, truncate(&text, 300)));
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                Err(err.retryable())
            } else {
                Err(err)
            };
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[async_trait]
impl RemoteSource for IgdbClient {
    #[instrument(skip(self))]
    async fn count(
        &self,
        kind: EntityKind,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<u64, RemoteFetchError> {
        let path = format!("{}/count", kind.spec().endpoint);
        let resp: CountResponse = self
            .execute(&path, count_query(kind, updated_since), kind, FetchStage::Count, 0)
            .await?;
        Ok(resp.count)
    }

    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        kind: EntityKind,
        limit: u32,
        offset: u64,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>, RemoteFetchError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let body = page_query(kind, limit, offset, updated_since);
        self.execute(kind.spec().endpoint, body, kind, FetchStage::Page, offset)
            .await
    }
}
