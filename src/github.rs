use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::pacing::{Pacer, RetryPolicy};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Longest error body kept in logs
const MAX_ERROR_BODY: usize = 300;

// === Credentials ===

/// Supplies one bearer token per outbound request
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Picks a token uniformly at random for every request
#[derive(Debug, Clone, Default)]
pub struct TokenPool {
    tokens: Vec<String>,
}

impl TokenPool {
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CredentialProvider for TokenPool {
    fn token(&self) -> Option<String> {
        self.tokens.choose(&mut rand::thread_rng()).cloned()
    }
}

// === Search types ===

/// Which search endpoint a query runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Repositories,
    Code,
}

impl SearchKind {
    pub fn path(&self) -> &'static str {
        match self {
            SearchKind::Repositories => "/search/repositories",
            SearchKind::Code => "/search/code",
        }
    }

    /// Extract the repository identifier from one search item
    fn identifier(&self, item: &serde_json::Value) -> Option<String> {
        let name = match self {
            SearchKind::Repositories => item.get("full_name"),
            SearchKind::Code => item.get("repository").and_then(|r| r.get("full_name")),
        };
        name.and_then(|v| v.as_str()).map(String::from)
    }

    /// Whether a failed page request is worth retrying.
    ///
    /// Repository search gives up on any HTTP status (422 past the result
    /// window, 403 rate limit) and only retries transport failures; code
    /// search retries every transient error.
    pub fn should_retry(&self, err: &ApiError) -> bool {
        match self {
            SearchKind::Repositories => matches!(err, ApiError::Network(_)),
            SearchKind::Code => err.is_transient(),
        }
    }
}

/// One search hit, reduced to its repository
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub full_name: String,
    /// Full metadata, present for repository search hits
    pub record: Option<RepoRecord>,
}

#[cfg(test)]
impl SearchItem {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            record: None,
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub total_count: u64,
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct RawSearchPage {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

impl SearchPage {
    fn from_raw(kind: SearchKind, raw: RawSearchPage) -> Self {
        let items = raw
            .items
            .into_iter()
            .filter_map(|value| {
                let full_name = kind.identifier(&value)?;
                let record = match kind {
                    SearchKind::Repositories => serde_json::from_value(value).ok(),
                    SearchKind::Code => None,
                };
                Some(SearchItem { full_name, record })
            })
            .collect();
        Self {
            total_count: raw.total_count,
            items,
        }
    }
}

// === Repository metadata ===

/// Fixed metadata schema collected for every repository
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RepoRecord {
    pub full_name: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub size: Option<u64>,
    pub stargazers_count: Option<u64>,
    pub language: Option<String>,
    pub has_issues: Option<bool>,
    pub forks_count: Option<u64>,
    pub archived: Option<bool>,
    pub open_issues_count: Option<u64>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub open_issues: Option<u64>,
    pub description: Option<String>,
    pub fork: Option<bool>,
}

impl RepoRecord {
    pub const COLUMNS: [&'static str; 14] = [
        "full_name",
        "created_at",
        "updated_at",
        "size",
        "stargazers_count",
        "language",
        "has_issues",
        "forks_count",
        "archived",
        "open_issues_count",
        "topics",
        "open_issues",
        "description",
        "fork",
    ];

    /// Row in [`RepoRecord::COLUMNS`] order; absent values become empty cells
    pub fn to_row(&self) -> Vec<String> {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(|x| x.to_string()).unwrap_or_default()
        }

        vec![
            self.full_name.clone(),
            opt(&self.created_at),
            opt(&self.updated_at),
            opt(&self.size),
            opt(&self.stargazers_count),
            opt(&self.language),
            opt(&self.has_issues),
            opt(&self.forks_count),
            opt(&self.archived),
            opt(&self.open_issues_count),
            self.topics.join(","),
            opt(&self.open_issues),
            opt(&self.description),
            opt(&self.fork),
        ]
    }

    /// Case-insensitive keyword match on repo name, description, or topics
    pub fn matches_keywords(&self, keywords: &[String]) -> bool {
        let name = self
            .full_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let description = self.description.as_deref().unwrap_or_default().to_lowercase();
        let topics: Vec<String> = self.topics.iter().map(|t| t.to_lowercase()).collect();

        keywords.iter().map(|k| k.to_lowercase()).any(|k| {
            name.contains(&k) || description.contains(&k) || topics.iter().any(|t| t.contains(&k))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimit,
    pub search: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

// === API seams ===

/// Paginated search endpoint. One call is one HTTP request, no retries.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(
        &self,
        kind: SearchKind,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, ApiError>;
}

/// Single-resource repository endpoints. One call is one HTTP request.
#[async_trait]
pub trait RepoApi: Send + Sync {
    /// Repository metadata; `Ok(None)` when the repository does not exist
    async fn get_repo(&self, full_name: &str) -> Result<Option<RepoRecord>, ApiError>;

    /// Number of contributors listed on one page (anonymous included)
    async fn contributors_page(&self, full_name: &str, page: u32, per_page: u32) -> Result<usize, ApiError>;

    /// Author dates of the first page of commits
    async fn commit_dates(&self, full_name: &str) -> Result<Vec<DateTime<Utc>>, ApiError>;
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Every attempt is followed by `pacer.pace()`; failed attempts
/// additionally wait `policy.backoff * attempt`.
pub async fn retry_request<T, F, Fut, R>(
    policy: &RetryPolicy,
    pacer: &dyn Pacer,
    retryable: R,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    R: Fn(&ApiError) -> bool,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = op().await;
        pacer.pace().await;

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                warn!(attempt, max_attempts, error = %e, "request failed, retrying");
                policy.wait(attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// === REST client ===

/// GitHub REST client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GitHubClient {
    pub fn new(api_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repo-miner/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Build request with auth header if a token is available
    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_url, path);
        let mut req = self.client.get(url);
        if let Some(token) = self.credentials.token() {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send a GET and turn any non-success status into [`ApiError::Status`]
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<reqwest::Response, ApiError> {
        let start = Instant::now();
        let response = self.request(path).query(params).send().await?;
        let status = response.status();
        debug!(path, status = status.as_u16(), elapsed_ms = start.elapsed().as_millis() as u64, "GET");

        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            body.truncate(cut);
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Check rate limit status (REST core and search buckets)
    pub async fn rate_limit(&self) -> Result<RateLimitResources, ApiError> {
        let response = self.get("/rate_limit", &[]).await?;
        let data: RateLimitResponse = response.json().await?;
        Ok(data.resources)
    }
}

#[async_trait]
impl SearchApi for GitHubClient {
    async fn search(
        &self,
        kind: SearchKind,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, ApiError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        if kind == SearchKind::Repositories {
            params.push(("sort", "stars".to_string()));
            params.push(("order", "desc".to_string()));
        }

        let response = self.get(kind.path(), &params).await?;
        let raw: RawSearchPage = response.json().await?;
        Ok(SearchPage::from_raw(kind, raw))
    }
}

#[async_trait]
impl RepoApi for GitHubClient {
    async fn get_repo(&self, full_name: &str) -> Result<Option<RepoRecord>, ApiError> {
        match self.get(&format!("/repos/{}", full_name), &[]).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(ApiError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn contributors_page(&self, full_name: &str, page: u32, per_page: u32) -> Result<usize, ApiError> {
        let params = [
            ("per_page", per_page.to_string()),
            ("page", page.to_string()),
            ("anon", "true".to_string()),
        ];
        let response = self.get(&format!("/repos/{}/contributors", full_name), &params).await?;

        // empty repositories answer 204 with no body
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(0);
        }
        let contributors: Vec<serde_json::Value> = response.json().await?;
        Ok(contributors.len())
    }

    async fn commit_dates(&self, full_name: &str) -> Result<Vec<DateTime<Utc>>, ApiError> {
        let params = [("per_page", "100".to_string())];
        let response = self.get(&format!("/repos/{}/commits", full_name), &params).await?;
        let commits: Vec<CommitEntry> = response.json().await?;

        Ok(commits
            .into_iter()
            .filter_map(|c| c.commit.author.and_then(|a| a.date))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::NoPacer;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_token_pool_picks_from_pool() {
        let pool = TokenPool::new(vec!["a".into(), " ".into(), "b".into()]);
        assert_eq!(pool.len(), 2);
        for _ in 0..20 {
            let token = pool.token().unwrap();
            assert!(token == "a" || token == "b");
        }
        assert_eq!(TokenPool::new(vec![]).token(), None);
    }

    #[test]
    fn test_code_search_items_use_nested_repository() {
        let raw: RawSearchPage = serde_json::from_value(serde_json::json!({
            "total_count": 2,
            "items": [
                {"name": "policy.rego", "repository": {"full_name": "acme/policies"}},
                {"name": "orphan.rego"}
            ]
        }))
        .unwrap();

        let page = SearchPage::from_raw(SearchKind::Code, raw);
        assert_eq!(page.total_count, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].full_name, "acme/policies");
        assert!(page.items[0].record.is_none());
    }

    #[test]
    fn test_repository_search_items_carry_record() {
        let raw: RawSearchPage = serde_json::from_value(serde_json::json!({
            "total_count": 1,
            "items": [{
                "full_name": "acme/ml",
                "stargazers_count": 42,
                "language": "Python",
                "topics": ["machine-learning", "mlops"],
                "fork": false
            }]
        }))
        .unwrap();

        let page = SearchPage::from_raw(SearchKind::Repositories, raw);
        let record = page.items[0].record.as_ref().unwrap();
        assert_eq!(record.stargazers_count, Some(42));
        assert_eq!(record.created_at, None);
        assert_eq!(record.topics, vec!["machine-learning", "mlops"]);
    }

    #[test]
    fn test_record_row_matches_columns() {
        let record = RepoRecord {
            full_name: "acme/ml".into(),
            size: Some(10),
            archived: Some(false),
            topics: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let row = record.to_row();
        assert_eq!(row.len(), RepoRecord::COLUMNS.len());
        assert_eq!(row[0], "acme/ml");
        assert_eq!(row[1], "");
        assert_eq!(row[3], "10");
        assert_eq!(row[8], "false");
        assert_eq!(row[10], "a,b");
    }

    #[test]
    fn test_matches_keywords() {
        let record = RepoRecord {
            full_name: "acme/gcp-vision".into(),
            description: Some("Object detection on Cloud".into()),
            topics: vec!["Deep-Learning".into()],
            ..Default::default()
        };
        assert!(record.matches_keywords(&["vision".into()]));
        assert!(record.matches_keywords(&["object-detection".into(), "cloud".into()]));
        assert!(record.matches_keywords(&["deep-learning".into()]));
        assert!(!record.matches_keywords(&["acme".into()]));
        assert!(!record.matches_keywords(&[]));
    }

    #[test]
    fn test_should_retry_by_kind() {
        let server = ApiError::Status { status: 500, body: String::new() };
        let network = ApiError::Network("reset".into());

        assert!(SearchKind::Code.should_retry(&server));
        assert!(SearchKind::Code.should_retry(&network));
        assert!(!SearchKind::Repositories.should_retry(&server));
        assert!(SearchKind::Repositories.should_retry(&network));
    }

    #[tokio::test]
    async fn test_retry_request_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let result: Result<(), ApiError> = retry_request(&policy, &NoPacer, |e| e.is_transient(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Status { status: 502, body: String::new() }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_request_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let result: Result<(), ApiError> = retry_request(&policy, &NoPacer, |e| e.is_transient(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Status { status: 422, body: String::new() }) }
        })
        .await;

        assert_eq!(result.unwrap_err().status(), Some(422));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_request_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result = retry_request(&policy, &NoPacer, |e| e.is_transient(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::Network("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }
}
