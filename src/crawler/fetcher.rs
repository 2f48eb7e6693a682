//! Remote API client
//!
//! This module handles all HTTP requests for the harvester, including:
//! - Building the HTTP client with authentication and API headers
//! - Paginated listing, dependency, and detail requests
//! - Reading quota headers from every response
//! - Mapping HTTP failures onto `FetchError`

use crate::config::ApiConfig;
use crate::crawler::phase::{DependencyKind, ListingKind};
use crate::crawler::rate_limiter::QuotaHeaders;
use crate::crawler::RepositoryKey;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Name of the environment variable holding the API token
pub const TOKEN_ENV: &str = "GH_TOKEN";

/// API token; never printed
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Reads the token from `GH_TOKEN`
    pub fn from_env() -> Option<Self> {
        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(|token| Self(token.trim().to_string()))
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Successful response: the decoded JSON body and its quota headers
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: Value,
    pub quota: Option<QuotaHeaders>,
}

impl ApiResponse {
    pub fn new(body: Value) -> Self {
        Self { body, quota: None }
    }
}

/// Failure of a single remote call
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: HTTP {status}")]
    Server {
        status: u16,
        quota: Option<QuotaHeaders>,
    },

    #[error("Quota exceeded (HTTP {status})")]
    QuotaExceeded {
        status: u16,
        reset_at: Option<DateTime<Utc>>,
        quota: Option<QuotaHeaders>,
    },

    #[error("Not found: HTTP {status}")]
    NotFound {
        status: u16,
        quota: Option<QuotaHeaders>,
    },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Authentication rejected: HTTP {status}")]
    Authentication { status: u16 },

    #[error("Request rejected: HTTP {status}")]
    Rejected {
        status: u16,
        quota: Option<QuotaHeaders>,
    },
}

impl FetchError {
    /// Quota headers carried by the failed response, if any
    pub fn quota(&self) -> Option<QuotaHeaders> {
        match self {
            Self::Server { quota, .. }
            | Self::QuotaExceeded { quota, .. }
            | Self::NotFound { quota, .. }
            | Self::Rejected { quota, .. } => *quota,
            _ => None,
        }
    }
}

/// Result type for remote calls
pub type FetchResult<T> = Result<T, FetchError>;

/// The remote operations the orchestrator needs
///
/// Every call fetches exactly one page, so each page is acquired and retried
/// on its own.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of a top-level listing
    async fn list_page(
        &self,
        repo: &RepositoryKey,
        kind: ListingKind,
        page: u32,
        per_page: u32,
    ) -> FetchResult<ApiResponse>;

    /// One page of a pull request's sub-resource
    async fn list_dependency(
        &self,
        repo: &RepositoryKey,
        kind: DependencyKind,
        number: u64,
        page: u32,
        per_page: u32,
    ) -> FetchResult<ApiResponse>;

    /// Full record of one commit
    async fn fetch_detail(&self, repo: &RepositoryKey, sha: &str) -> FetchResult<ApiResponse>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The API configuration
/// * `credential` - Token sent as a bearer authorization header
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(
    config: &ApiConfig,
    credential: &Credential,
) -> Result<Client, reqwest::Error> {
    let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/vnd.github+json"),
    );
    // An unencodable token is sent without auth and rejected with 401
    if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", credential.expose())) {
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .timeout(Duration::from_secs(config.request_timeout))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Reads `X-RateLimit-*` headers; None if any of them is missing or invalid
pub fn parse_quota_headers(headers: &HeaderMap) -> Option<QuotaHeaders> {
    let number = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };

    let remaining = u32::try_from(number("x-ratelimit-remaining")?).ok()?;
    let limit = u32::try_from(number("x-ratelimit-limit")?).ok()?;
    let reset_at = DateTime::from_timestamp(number("x-ratelimit-reset")?, 0)?;

    Some(QuotaHeaders {
        remaining,
        limit,
        reset_at,
    })
}

/// Reset time of a quota rejection, from `Retry-After` or the reset header
fn rejection_reset(headers: &HeaderMap, quota: Option<QuotaHeaders>) -> Option<DateTime<Utc>> {
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|secs| Utc::now() + ChronoDuration::seconds(secs));

    retry_after.or(quota.map(|q| q.reset_at))
}

/// Maps a non-success response onto a `FetchError`
///
/// A 403 only counts as a quota rejection when the server says so: no quota
/// left, a `Retry-After`, or a rate-limit message. Any other 403 is a
/// permission problem for that one resource.
fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    quota: Option<QuotaHeaders>,
) -> FetchError {
    let code = status.as_u16();
    match code {
        401 => FetchError::Authentication { status: code },
        429 => FetchError::QuotaExceeded {
            status: code,
            reset_at: rejection_reset(headers, quota),
            quota,
        },
        403 => {
            let spent = quota.is_some_and(|q| q.remaining == 0);
            let throttled = headers.contains_key(RETRY_AFTER)
                || body.to_ascii_lowercase().contains("rate limit");
            if spent || throttled {
                FetchError::QuotaExceeded {
                    status: code,
                    reset_at: rejection_reset(headers, quota),
                    quota,
                }
            } else {
                FetchError::Rejected {
                    status: code,
                    quota,
                }
            }
        }
        404 | 410 | 422 => FetchError::NotFound {
            status: code,
            quota,
        },
        500..=599 => FetchError::Server {
            status: code,
            quota,
        },
        _ => FetchError::Rejected {
            status: code,
            quota,
        },
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}

/// `RemoteApi` implementation for the GitHub REST API
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
}

impl GitHubClient {
    /// Creates a client for the API at `config.base_url`
    pub fn new(config: &ApiConfig, credential: &Credential) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config, credential)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn repo_url(&self, repo: &RepositoryKey, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.base_url, repo.owner, repo.name, path
        )
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> FetchResult<ApiResponse> {
        tracing::trace!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let quota = parse_quota_headers(&headers);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, quota));
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Malformed(format!("{}: {}", url, e)))?;

        Ok(ApiResponse { body, quota })
    }
}

fn page_query(page: u32, per_page: u32) -> Vec<(&'static str, String)> {
    vec![("per_page", per_page.to_string()), ("page", page.to_string())]
}

#[async_trait]
impl RemoteApi for GitHubClient {
    async fn list_page(
        &self,
        repo: &RepositoryKey,
        kind: ListingKind,
        page: u32,
        per_page: u32,
    ) -> FetchResult<ApiResponse> {
        let mut query = page_query(page, per_page);
        if kind == ListingKind::PullRequests {
            query.push(("state", "all".to_string()));
        }
        self.get(&self.repo_url(repo, kind.endpoint()), &query).await
    }

    async fn list_dependency(
        &self,
        repo: &RepositoryKey,
        kind: DependencyKind,
        number: u64,
        page: u32,
        per_page: u32,
    ) -> FetchResult<ApiResponse> {
        let path = format!("pulls/{}/{}", number, kind.as_str());
        self.get(&self.repo_url(repo, &path), &page_query(page, per_page))
            .await
    }

    async fn fetch_detail(&self, repo: &RepositoryKey, sha: &str) -> FetchResult<ApiResponse> {
        let path = format!("commits/{}", sha);
        self.get(&self.repo_url(repo, &path), &[]).await
    }
}
