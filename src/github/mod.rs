//! GitHub REST/GraphQL façade (§4.B): retries with full jitter, typed error
//! classification, installation-token minting/caching, pagination, and label ops.
//!
//! The transport is a capability trait so the scheduler/queue/relationship/reconcile
//! layers can be tested against an in-memory fake instead of real HTTP, per the
//! re-architecture notes.

pub mod auth;
pub mod error;
pub mod labels;
pub mod ops;
pub mod pagination;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::errors::{GitHubApiError, GitHubErrorCode};
use auth::{CachedToken, InstallationTokenCache, TokenSigner};

/// A single HTTP response, normalized for the rest of the crate: headers lowercased,
/// `Link`/`ETag` pulled out since callers reach for them constantly.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub link: Option<String>,
    pub etag: Option<String>,
}

/// Capability interface the rest of the crate depends on instead of `reqwest`
/// directly, so tests can substitute an in-memory fake.
#[async_trait]
pub trait GitHubTransport: Send + Sync {
    async fn rest(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<RestResponse, GitHubApiError>;

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, GitHubApiError>;
}

/// Resolves a bearer token to attach to outgoing requests; abstracts over the PAT
/// and GitHub-App-installation auth schemes described in §4.J.
#[async_trait]
pub trait GitHubTokenProvider: Send + Sync {
    async fn bearer_token(&self, now_unix: i64) -> Result<String, GitHubApiError>;
}

/// A fixed personal-access-token: single-operator setups that don't need app
/// installation tokens at all.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl GitHubTokenProvider for StaticTokenProvider {
    async fn bearer_token(&self, _now_unix: i64) -> Result<String, GitHubApiError> {
        Ok(self.0.clone())
    }
}

/// Mints and caches a GitHub App installation token, minting a fresh JWT only when
/// the cached installation token needs refreshing.
pub struct AppInstallationTokenProvider {
    http: reqwest::Client,
    app_id: String,
    installation_id: i64,
    signer: Arc<dyn TokenSigner>,
    cache: InstallationTokenCache,
}

impl AppInstallationTokenProvider {
    pub fn new(
        http: reqwest::Client,
        app_id: String,
        installation_id: i64,
        signer: Arc<dyn TokenSigner>,
    ) -> Self {
        Self {
            http,
            app_id,
            installation_id,
            signer,
            cache: InstallationTokenCache::new(),
        }
    }
}

#[async_trait]
impl GitHubTokenProvider for AppInstallationTokenProvider {
    async fn bearer_token(&self, now_unix: i64) -> Result<String, GitHubApiError> {
        let app_id = self.app_id.clone();
        let installation_id = self.installation_id;
        let signer = self.signer.clone();
        let http = self.http.clone();

        self.cache
            .get_or_refresh(installation_id, now_unix, move || async move {
                let jwt = signer.sign_app_jwt(&app_id, now_unix)?;
                let url = format!(
                    "https://api.github.com/app/installations/{installation_id}/access_tokens"
                );
                let resp = http
                    .post(&url)
                    .bearer_auth(jwt)
                    .header("Accept", "application/vnd.github+json")
                    .header("User-Agent", "ralph-daemon")
                    .send()
                    .await
                    .map_err(|e| error::classify_network_error(e.to_string()))?;

                let status = resp.status().as_u16();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| error::classify_network_error(e.to_string()))?;
                if status >= 400 {
                    return Err(error::classify_response(status, &HashMap::new(), &text));
                }

                #[derive(serde::Deserialize)]
                struct AccessTokenResponse {
                    token: String,
                    expires_at: String,
                }
                let parsed: AccessTokenResponse = serde_json::from_str(&text).map_err(|e| {
                    GitHubApiError::new(
                        format!("failed to parse installation token response: {e}"),
                        GitHubErrorCode::Unknown,
                    )
                })?;
                let expires_at_unix = chrono::DateTime::parse_from_rfc3339(&parsed.expires_at)
                    .map(|dt| dt.timestamp())
                    .unwrap_or(now_unix + 3600);

                Ok(CachedToken {
                    token: parsed.token,
                    expires_at_unix,
                })
            })
            .await
    }
}

/// Production [`GitHubTransport`] backed by `reqwest`.
pub struct HttpGitHubClient {
    client: reqwest::Client,
    token_provider: Arc<dyn GitHubTokenProvider>,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl HttpGitHubClient {
    pub fn new(token_provider: Arc<dyn GitHubTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_provider,
            now_fn: Arc::new(crate::util::now_unix_secs),
        }
    }
}

#[async_trait]
impl GitHubTransport for HttpGitHubClient {
    async fn rest(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<RestResponse, GitHubApiError> {
        let now = (self.now_fn)();
        let token = self.token_provider.bearer_token(now).await?;
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("https://api.github.com{path}")
        };

        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ralph-daemon")
            .query(query);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| error::classify_network_error(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let link = headers.get("link").cloned();
        let etag = headers.get("etag").cloned();

        let text = resp
            .text()
            .await
            .map_err(|e| error::classify_network_error(e.to_string()))?;

        if status >= 400 {
            return Err(error::classify_response(status, &headers, &text));
        }

        let body: Value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                GitHubApiError::new(
                    format!("failed to parse github response body: {e}"),
                    GitHubErrorCode::Unknown,
                )
                .with_status(status)
                .with_response_text(&text)
            })?
        };

        Ok(RestResponse {
            status,
            headers,
            body,
            link,
            etag,
        })
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, GitHubApiError> {
        let payload = serde_json::json!({ "query": query, "variables": variables });
        let resp = self
            .rest(Method::POST, "https://api.github.com/graphql", &[], Some(payload))
            .await?;

        if let Some(errors) = resp.body.get("errors") {
            if errors.as_array().is_some_and(|a| !a.is_empty()) {
                return Err(GitHubApiError::new(
                    format!("graphql errors: {errors}"),
                    GitHubErrorCode::Validation,
                ));
            }
        }
        Ok(resp.body.get("data").cloned().unwrap_or(Value::Null))
    }
}
