//! GitHub REST implementation of `RepositoryProvider`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use repoguard_core::{
    ActorList, BranchSettings, ProtectionRules, PullRequestReviewRules, ServiceType,
    StatusCheckRules, CORRELATION_ID_HEADER,
};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use crate::provider::{BranchCreation, FileCommit, ProviderError, ProviderOperation, RepositoryProvider};
use crate::recording::{RecordingLogger, RecordingMiddleware};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

/// Identity recorded on commits made through the contents API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

/// Client for one invocation: a shared connection pool plus this
/// invocation's token and correlation ID.
#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    token: String,
    committer: Option<Committer>,
    correlation_id: Option<String>,
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    committer: Option<&'a Committer>,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    commit: Option<CommitSha>,
}

#[derive(Debug, Deserialize)]
struct CommitSha {
    sha: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    assignees: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    number: u64,
    #[serde(default)]
    title: String,
    created_at: Option<DateTime<Utc>>,
    /// Present when the "issue" is really a pull request.
    pull_request: Option<serde_json::Value>,
}

/// `GET /branches/{branch}/protection` response. Every section is optional.
#[derive(Debug, Default, Deserialize)]
struct ProtectionResponse {
    enforce_admins: Option<EnabledFlag>,
    required_pull_request_reviews: Option<ReviewsResponse>,
    required_status_checks: Option<StatusChecksResponse>,
    restrictions: Option<ActorsResponse>,
    required_linear_history: Option<EnabledFlag>,
    allow_force_pushes: Option<EnabledFlag>,
    allow_deletions: Option<EnabledFlag>,
    block_creations: Option<EnabledFlag>,
    required_conversation_resolution: Option<EnabledFlag>,
    lock_branch: Option<EnabledFlag>,
    allow_fork_syncing: Option<EnabledFlag>,
}

#[derive(Debug, Deserialize)]
struct EnabledFlag {
    #[serde(default)]
    enabled: bool,
}

fn enabled(flag: Option<EnabledFlag>) -> bool {
    flag.is_some_and(|f| f.enabled)
}

#[derive(Debug, Deserialize)]
struct ReviewsResponse {
    #[serde(default)]
    required_approving_review_count: u32,
    #[serde(default)]
    require_code_owner_reviews: bool,
    #[serde(default)]
    dismiss_stale_reviews: bool,
    #[serde(default)]
    require_last_push_approval: bool,
    dismissal_restrictions: Option<ActorsResponse>,
    bypass_pull_request_allowances: Option<ActorsResponse>,
}

#[derive(Debug, Deserialize)]
struct StatusChecksResponse {
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    contexts: Vec<String>,
}

/// Users, teams and apps as full objects; requests name them by login/slug.
#[derive(Debug, Deserialize)]
struct ActorsResponse {
    #[serde(default)]
    users: Vec<Login>,
    #[serde(default)]
    teams: Vec<Slug>,
    #[serde(default)]
    apps: Vec<Slug>,
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Slug {
    slug: String,
}

impl From<ActorsResponse> for ActorList {
    fn from(actors: ActorsResponse) -> Self {
        ActorList {
            users: actors.users.into_iter().map(|u| u.login).collect(),
            teams: actors.teams.into_iter().map(|t| t.slug).collect(),
            apps: actors.apps.into_iter().map(|a| a.slug).collect(),
        }
    }
}

impl From<ProtectionResponse> for ProtectionRules {
    fn from(response: ProtectionResponse) -> Self {
        ProtectionRules {
            enforce_admins: enabled(response.enforce_admins),
            pull_request_reviews: response.required_pull_request_reviews.map(|reviews| {
                PullRequestReviewRules {
                    required_approving_review_count: reviews.required_approving_review_count,
                    require_code_owner_reviews: reviews.require_code_owner_reviews,
                    dismiss_stale_reviews: reviews.dismiss_stale_reviews,
                    require_last_push_approval: reviews.require_last_push_approval,
                    dismissal_restrictions: reviews.dismissal_restrictions.map(ActorList::from),
                    bypass_pull_request_allowances: reviews
                        .bypass_pull_request_allowances
                        .map(ActorList::from),
                }
            }),
            required_status_checks: response.required_status_checks.map(|checks| {
                StatusCheckRules {
                    strict: checks.strict,
                    contexts: checks.contexts,
                }
            }),
            restrictions: response.restrictions.map(ActorList::from),
            settings: BranchSettings {
                required_linear_history: enabled(response.required_linear_history),
                allow_force_pushes: enabled(response.allow_force_pushes),
                allow_deletions: enabled(response.allow_deletions),
                block_creations: enabled(response.block_creations),
                required_conversation_resolution: enabled(response.required_conversation_resolution),
                lock_branch: enabled(response.lock_branch),
                allow_fork_syncing: enabled(response.allow_fork_syncing),
            },
        }
    }
}

fn actors_body(actors: &ActorList) -> serde_json::Value {
    serde_json::json!({
        "users": actors.users,
        "teams": actors.teams,
        "apps": actors.apps,
    })
}

/// Request body for `PUT /branches/{branch}/protection`.
///
/// The PUT replaces the whole rule set, so every setting read back from the
/// GET is written again. GitHub requires the four original top-level keys,
/// with `null` meaning "off".
pub fn protection_request_body(rules: &ProtectionRules) -> serde_json::Value {
    let reviews = rules.pull_request_reviews.as_ref().map(|reviews| {
        let mut body = serde_json::json!({
            "dismiss_stale_reviews": reviews.dismiss_stale_reviews,
            "require_code_owner_reviews": reviews.require_code_owner_reviews,
            "required_approving_review_count": reviews.required_approving_review_count,
            "require_last_push_approval": reviews.require_last_push_approval,
        });
        if let Some(actors) = &reviews.dismissal_restrictions {
            body["dismissal_restrictions"] = actors_body(actors);
        }
        if let Some(actors) = &reviews.bypass_pull_request_allowances {
            body["bypass_pull_request_allowances"] = actors_body(actors);
        }
        body
    });
    let settings = &rules.settings;

    serde_json::json!({
        "required_status_checks": rules.required_status_checks.as_ref().map(|checks| serde_json::json!({
            "strict": checks.strict,
            "contexts": checks.contexts,
        })),
        "enforce_admins": rules.enforce_admins,
        "required_pull_request_reviews": reviews,
        "restrictions": rules.restrictions.as_ref().map(actors_body),
        "required_linear_history": settings.required_linear_history,
        "allow_force_pushes": settings.allow_force_pushes,
        "allow_deletions": settings.allow_deletions,
        "block_creations": settings.block_creations,
        "required_conversation_resolution": settings.required_conversation_resolution,
        "lock_branch": settings.lock_branch,
        "allow_fork_syncing": settings.allow_fork_syncing,
    })
}

// =============================================================================
// Failure classification
// =============================================================================

/// Classify a non-success response.
///
/// 408, 429 and 5xx are transient, and so is a 403 that is really a rate
/// limit (primary limits set `x-ratelimit-remaining: 0`, secondary limits
/// only say so in the message). Everything else is permanent.
pub fn classify_failure(
    operation: ProviderOperation,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProviderError {
    let message = format!("{} - {}", status, body.trim());
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let rate_limited = status == StatusCode::FORBIDDEN
        && (header("x-ratelimit-remaining") == Some("0")
            || body.to_ascii_lowercase().contains("rate limit"));

    let transient = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        || rate_limited;

    if !transient {
        return ProviderError::permanent(operation, Some(status.as_u16()), message);
    }

    let retry_after = header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .or_else(|| {
            // Primary rate limits advertise the reset time instead.
            let reset = header("x-ratelimit-reset")?.trim().parse::<i64>().ok()?;
            let wait = reset - Utc::now().timestamp();
            (rate_limited && wait > 0).then(|| Duration::from_secs(wait as u64))
        });

    let error = ProviderError::transient(operation, message);
    match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

fn classify_send_error(operation: ProviderOperation, err: reqwest_middleware::Error) -> ProviderError {
    match err {
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
            ProviderError::transient(operation, format!("request failed: {}", e))
        }
        other => ProviderError::permanent(operation, None, format!("request failed: {}", other)),
    }
}

fn decode_error(operation: ProviderOperation, err: impl std::fmt::Display) -> ProviderError {
    ProviderError::permanent(operation, None, format!("failed to parse response: {}", err))
}

/// The connection failed while the body was streaming in.
fn body_error(operation: ProviderOperation, err: reqwest::Error) -> ProviderError {
    if err.is_body() || err.is_decode() || err.is_timeout() {
        ProviderError::transient(operation, format!("failed to read response body: {}", err))
    } else {
        ProviderError::permanent(operation, None, format!("failed to read response body: {}", err))
    }
}

/// Read the whole body, then parse it. Only a body that arrived intact and
/// still does not parse is a permanent failure.
async fn read_json<T: DeserializeOwned>(
    operation: ProviderOperation,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let body = response.bytes().await.map_err(|e| body_error(operation, e))?;
    serde_json::from_slice(&body).map_err(|e| decode_error(operation, e))
}

// =============================================================================
// Client
// =============================================================================

impl GitHubClient {
    pub fn new(client: ClientWithMiddleware, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            committer: None,
            correlation_id: None,
        }
    }

    pub fn with_committer(mut self, committer: Option<Committer>) -> Self {
        self.committer = committer;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// API URL with `segments` appended, each percent-encoded on its own so
    /// that branch names containing `#`, `?` or `%` stay in their segment.
    fn url(&self, operation: ProviderOperation, segments: &[&str]) -> Result<Url, ProviderError> {
        let invalid = |detail: String| ProviderError::permanent(operation, None, format!("invalid URL: {}", detail));
        let mut url = Url::parse(&self.api_url).map_err(|e| invalid(format!("{}: {}", self.api_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("{} cannot take a path", self.api_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `/repos/{owner}/{repo}/contents/{path}`, keeping the directories of
    /// `path` as separate segments.
    fn contents_url(
        &self,
        operation: ProviderOperation,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Url, ProviderError> {
        let mut segments = vec!["repos", owner, repo, "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.url(operation, &segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);

        if let Some(cid) = &self.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, cid);
        }
        builder
    }

    async fn send(
        &self,
        operation: ProviderOperation,
        builder: RequestBuilder,
    ) -> Result<reqwest::Response, ProviderError> {
        builder
            .send()
            .await
            .map_err(|e| classify_send_error(operation, e))
    }

    /// Turn a non-success response into a classified error, logging it.
    async fn failure(&self, operation: ProviderOperation, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        error!("GitHub API error during {}: {} - {}", operation, status, body);
        classify_failure(operation, status, &headers, &body)
    }

    async fn branch_head(
        &self,
        operation: ProviderOperation,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>, ProviderError> {
        let url = self.url(operation, &["repos", owner, repo, "branches", branch])?;
        let response = self.send(operation, self.request(Method::GET, url)).await?;

        match response.status() {
            status if status.is_success() => {
                let branch: BranchResponse = read_json(operation, response).await?;
                Ok(Some(branch.commit.sha))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self.failure(operation, response).await),
        }
    }

    /// Head of some existing branch, or `None` when the repository is empty.
    async fn initial_head(&self, owner: &str, repo: &str) -> Result<Option<String>, ProviderError> {
        let op = ProviderOperation::CreateBranch;
        let mut url = self.url(op, &["repos", owner, repo, "branches"])?;
        url.query_pairs_mut().append_pair("per_page", "1");

        let response = self.send(op, self.request(Method::GET, url)).await?;
        match response.status() {
            status if status.is_success() => {
                let branches: Vec<BranchResponse> = read_json(op, response).await?;
                Ok(branches.into_iter().next().map(|b| b.commit.sha))
            }
            // Empty repositories answer 404 on some endpoints.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(None),
            _ => Err(self.failure(op, response).await),
        }
    }
}

#[async_trait]
impl RepositoryProvider for GitHubClient {
    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<Option<String>, ProviderError> {
        let op = ProviderOperation::GetDefaultBranch;
        let url = self.url(op, &["repos", owner, repo])?;
        let response = self.send(op, self.request(Method::GET, url)).await?;

        if !response.status().is_success() {
            return Err(self.failure(op, response).await);
        }

        let repository: RepositoryResponse = read_json(op, response).await?;
        let Some(branch) = repository.default_branch.filter(|b| !b.is_empty()) else {
            return Ok(None);
        };

        // An empty repository still advertises a default branch name.
        match self.branch_head(op, owner, repo, &branch).await? {
            Some(_) => Ok(Some(branch)),
            None => {
                info!("{}/{} advertises default branch {} but it does not exist yet", owner, repo, branch);
                Ok(None)
            }
        }
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        from_ref: Option<&str>,
    ) -> Result<BranchCreation, ProviderError> {
        let op = ProviderOperation::CreateBranch;

        if self.branch_head(op, owner, repo, name).await?.is_some() {
            return Ok(BranchCreation::AlreadyExists);
        }

        let sha = match from_ref {
            Some(reference) => self
                .branch_head(op, owner, repo, reference)
                .await?
                .ok_or_else(|| {
                    ProviderError::permanent(op, Some(404), format!("reference {} does not exist", reference))
                })?,
            None => match self.initial_head(owner, repo).await? {
                Some(sha) => sha,
                None => {
                    info!(
                        "{}/{} has no commits; branch {} will be created by the first commit",
                        owner, repo, name
                    );
                    return Ok(BranchCreation::Created);
                }
            },
        };

        info!("Creating branch {} in {}/{} at {}", name, owner, repo, sha);

        let url = self.url(op, &["repos", owner, repo, "git", "refs"])?;
        let body = CreateRefRequest {
            ref_name: format!("refs/heads/{}", name),
            sha: &sha,
        };
        let response = self.send(op, self.request(Method::POST, url).json(&body)).await?;

        match response.status() {
            status if status.is_success() => Ok(BranchCreation::Created),
            StatusCode::UNPROCESSABLE_ENTITY => {
                // "Reference already exists": a concurrent delivery won.
                warn!("Branch {} in {}/{} was created concurrently", name, owner, repo);
                Ok(BranchCreation::AlreadyExists)
            }
            _ => Err(self.failure(op, response).await),
        }
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, ProviderError> {
        let op = ProviderOperation::GetFile;
        let mut url = self.contents_url(op, owner, repo, path)?;
        url.query_pairs_mut().append_pair("ref", branch);

        let response = self.send(op, self.request(Method::GET, url)).await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(self.failure(op, response).await),
        }

        let value: serde_json::Value = read_json(op, response).await?;
        // A directory (array) at the path still counts as "something is there".
        let content = match value.get("content").and_then(|c| c.as_str()) {
            Some(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded.replace('\n', ""))
                    .map_err(|e| decode_error(op, e))?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        };
        Ok(Some(content))
    }

    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<FileCommit, ProviderError> {
        let op = ProviderOperation::PutFile;
        let url = self.contents_url(op, owner, repo, path)?;
        let body = PutContentsRequest {
            message,
            content: general_purpose::STANDARD.encode(content),
            branch,
            committer: self.committer.as_ref(),
        };

        info!("Committing {} to {}/{}@{}", path, owner, repo, branch);

        let response = self.send(op, self.request(Method::PUT, url).json(&body)).await?;
        match response.status() {
            status if status.is_success() => {
                let created: PutContentsResponse = read_json(op, response).await?;
                Ok(FileCommit::Committed {
                    sha: created.commit.and_then(|c| c.sha),
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                // Without a blob SHA GitHub refuses to overwrite an existing file.
                let failure = self.failure(op, response).await;
                match self.get_file(owner, repo, branch, path).await? {
                    Some(existing) => Ok(FileCommit::AlreadyExists {
                        same_content: existing == content,
                    }),
                    None => Err(failure),
                }
            }
            _ => Err(self.failure(op, response).await),
        }
    }

    async fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ProtectionRules>, ProviderError> {
        let op = ProviderOperation::GetBranchProtection;
        let url = self.url(op, &["repos", owner, repo, "branches", branch, "protection"])?;
        let response = self.send(op, self.request(Method::GET, url)).await?;

        match response.status() {
            status if status.is_success() => {
                let rules: ProtectionResponse = read_json(op, response).await?;
                Ok(Some(rules.into()))
            }
            // "Branch not protected"
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self.failure(op, response).await),
        }
    }

    async fn set_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        rules: &ProtectionRules,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::SetBranchProtection;
        let url = self.url(op, &["repos", owner, repo, "branches", branch, "protection"])?;

        info!("Updating branch protection on {}/{}@{}", owner, repo, branch);

        let response = self
            .send(op, self.request(Method::PUT, url).json(&protection_request_body(rules)))
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let error = self.failure(op, response).await;
        if error.status() == Some(403) && error.to_string().contains("Upgrade to GitHub Pro") {
            warn!(
                "Branch protection for private repositories requires a paid plan ({}/{})",
                owner, repo
            );
        }
        Err(error)
    }

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        assignee: Option<&str>,
    ) -> Result<u64, ProviderError> {
        let op = ProviderOperation::CreateIssue;
        let url = self.url(op, &["repos", owner, repo, "issues"])?;
        let request = CreateIssueRequest {
            title,
            body,
            assignees: assignee.into_iter().collect(),
        };

        let response = self.send(op, self.request(Method::POST, url).json(&request)).await?;
        if !response.status().is_success() {
            return Err(self.failure(op, response).await);
        }

        let issue: IssueResponse = read_json(op, response).await?;
        info!("Created issue #{} in {}/{}", issue.number, owner, repo);
        Ok(issue.number)
    }

    async fn find_issue_by_title(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        created_since: DateTime<Utc>,
    ) -> Result<Option<u64>, ProviderError> {
        let op = ProviderOperation::FindIssueByTitle;
        let mut url = self.url(op, &["repos", owner, repo, "issues"])?;
        url.query_pairs_mut()
            .append_pair("state", "all")
            .append_pair("since", &created_since.to_rfc3339())
            .append_pair("per_page", "100");

        let response = self.send(op, self.request(Method::GET, url)).await?;
        if !response.status().is_success() {
            return Err(self.failure(op, response).await);
        }

        // `since` filters on update time, so creation time is re-checked here.
        let issues: Vec<IssueResponse> = read_json(op, response).await?;
        Ok(issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none() && issue.title == title)
            .filter(|issue| issue.created_at.is_some_and(|at| at >= created_since))
            .map(|issue| issue.number)
            .max())
    }
}

pub fn create_github_client(recording_logger: Option<RecordingLogger>) -> Result<ClientWithMiddleware> {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(format!("repoguard/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("Failed to create HTTP client")?;

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger, ServiceType::GitHub));
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_server_errors_and_throttling_are_transient() {
        let op = ProviderOperation::GetFile;
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(
                classify_failure(op, status, &HeaderMap::new(), "").is_transient(),
                "{} should be transient",
                status
            );
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let op = ProviderOperation::SetBranchProtection;
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            let err = classify_failure(op, status, &HeaderMap::new(), "{\"message\":\"nope\"}");
            assert!(!err.is_transient());
            assert_eq!(err.status(), Some(status.as_u16()));
        }
    }

    #[test]
    fn test_rate_limited_forbidden_is_transient() {
        let op = ProviderOperation::CreateIssue;

        let primary = classify_failure(
            op,
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "0")]),
            "{\"message\":\"API rate limit exceeded\"}",
        );
        assert!(primary.is_transient());

        let secondary = classify_failure(
            op,
            StatusCode::FORBIDDEN,
            &HeaderMap::new(),
            "{\"message\":\"You have exceeded a secondary rate limit\"}",
        );
        assert!(secondary.is_transient());
    }

    #[test]
    fn test_retry_after_header_is_honoured() {
        let err = classify_failure(
            ProviderOperation::GetFile,
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "7")]),
            "",
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_protection_response_conversion() {
        let json = serde_json::json!({
            "url": "https://api.github.com/repos/acme/widgets/branches/main/protection",
            "enforce_admins": { "url": "...", "enabled": true },
            "required_pull_request_reviews": {
                "dismiss_stale_reviews": false,
                "require_code_owner_reviews": true,
                "required_approving_review_count": 2
            },
            "required_status_checks": { "strict": true, "contexts": ["ci"] },
            "restrictions": {
                "users": [{ "login": "octocat" }],
                "teams": [{ "slug": "core" }],
                "apps": []
            }
        });

        let response: ProtectionResponse = serde_json::from_value(json).unwrap();
        let rules = ProtectionRules::from(response);

        assert!(rules.enforce_admins);
        assert_eq!(
            rules.pull_request_reviews,
            Some(PullRequestReviewRules {
                required_approving_review_count: 2,
                require_code_owner_reviews: true,
                dismiss_stale_reviews: false,
                ..Default::default()
            })
        );
        assert_eq!(rules.required_status_checks.unwrap().contexts, vec!["ci"]);
        let restrictions = rules.restrictions.unwrap();
        assert_eq!(restrictions.users, vec!["octocat"]);
        assert_eq!(restrictions.teams, vec!["core"]);
    }

    #[test]
    fn test_minimal_protection_response() {
        let response: ProtectionResponse = serde_json::from_value(serde_json::json!({
            "url": "https://api.github.com/repos/acme/widgets/branches/main/protection"
        }))
        .unwrap();
        assert_eq!(ProtectionRules::from(response), ProtectionRules::default());
    }

    #[test]
    fn test_protection_request_body_sends_nulls_for_disabled_sections() {
        let rules = ProtectionRules {
            enforce_admins: true,
            pull_request_reviews: Some(PullRequestReviewRules {
                required_approving_review_count: 1,
                require_code_owner_reviews: true,
                dismiss_stale_reviews: false,
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            protection_request_body(&rules),
            serde_json::json!({
                "required_status_checks": null,
                "enforce_admins": true,
                "required_pull_request_reviews": {
                    "dismiss_stale_reviews": false,
                    "require_code_owner_reviews": true,
                    "required_approving_review_count": 1,
                    "require_last_push_approval": false
                },
                "restrictions": null,
                "required_linear_history": false,
                "allow_force_pushes": false,
                "allow_deletions": false,
                "block_creations": false,
                "required_conversation_resolution": false,
                "lock_branch": false,
                "allow_fork_syncing": false
            })
        );
    }

    #[test]
    fn test_combined_update_rewrites_settings_outside_policy() {
        let current: ProtectionResponse = serde_json::from_value(serde_json::json!({
            "enforce_admins": { "enabled": true },
            "required_pull_request_reviews": {
                "dismiss_stale_reviews": false,
                "require_code_owner_reviews": true,
                "required_approving_review_count": 0,
                "require_last_push_approval": true,
                "dismissal_restrictions": {
                    "users": [{ "login": "octocat" }],
                    "teams": [],
                    "apps": []
                },
                "bypass_pull_request_allowances": {
                    "users": [],
                    "teams": [{ "slug": "release" }],
                    "apps": [{ "slug": "deploy-bot" }]
                }
            },
            "required_linear_history": { "enabled": true },
            "allow_force_pushes": { "enabled": false },
            "required_conversation_resolution": { "enabled": true },
            "lock_branch": { "enabled": true }
        }))
        .unwrap();
        let current = ProtectionRules::from(current);

        let (diff, action) =
            repoguard_core::plan::decide_protection(&Default::default(), "main", Some(&current));
        assert!(diff.approvals);
        let rules = match action {
            repoguard_core::StepAction::UpdateProtection { rules, .. } => rules,
            other => panic!("expected an update, got {:?}", other),
        };

        let body = protection_request_body(&rules);
        assert_eq!(body["required_linear_history"], true);
        assert_eq!(body["required_conversation_resolution"], true);
        assert_eq!(body["lock_branch"], true);
        assert_eq!(body["allow_force_pushes"], false);

        let reviews = &body["required_pull_request_reviews"];
        assert_eq!(reviews["required_approving_review_count"], 1);
        assert_eq!(reviews["require_last_push_approval"], true);
        assert_eq!(
            reviews["dismissal_restrictions"],
            serde_json::json!({ "users": ["octocat"], "teams": [], "apps": [] })
        );
        assert_eq!(
            reviews["bypass_pull_request_allowances"],
            serde_json::json!({ "users": [], "teams": ["release"], "apps": ["deploy-bot"] })
        );
    }

    fn test_client(api_url: &str) -> GitHubClient {
        GitHubClient::new(create_github_client(None).unwrap(), api_url, "ghp_test")
    }

    #[test]
    fn test_url_segments_are_percent_encoded() {
        let client = test_client("https://api.github.com");
        let op = ProviderOperation::GetBranchProtection;

        let url = client
            .url(op, &["repos", "acme", "widgets", "branches", "release#1", "protection"])
            .unwrap();
        assert_eq!(url.path(), "/repos/acme/widgets/branches/release%231/protection");
        assert_eq!(url.fragment(), None);

        let url = client.url(op, &["repos", "acme", "widgets", "branches", "what?", "protection"]).unwrap();
        assert_eq!(url.path(), "/repos/acme/widgets/branches/what%3F/protection");
        assert_eq!(url.query(), None);

        let url = client.url(op, &["repos", "acme", "widgets", "branches", "100%"]).unwrap();
        assert_eq!(url.path(), "/repos/acme/widgets/branches/100%25");
    }

    #[test]
    fn test_api_url_prefix_and_nested_file_paths_are_kept() {
        let client = test_client("https://ghe.example.com/api/v3/");
        let url = client
            .contents_url(ProviderOperation::GetFile, "acme", "widgets", "docs/READ ME#.md")
            .unwrap();
        assert_eq!(url.path(), "/api/v3/repos/acme/widgets/contents/docs/READ%20ME%23.md");
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            // Promise more bytes than are sent, then hang up.
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n{\"default_branch\":")
                .await;
            let _ = socket.shutdown().await;
        });

        let client = test_client(&format!("http://{}", addr));
        let err = client.get_default_branch("acme", "widgets").await.unwrap_err();

        assert!(err.is_transient(), "expected transient, got {:?}", err);
    }

    #[tokio::test]
    async fn test_unparseable_body_is_permanent() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot json!")
                .await;
            let _ = socket.shutdown().await;
        });

        let client = test_client(&format!("http://{}", addr));
        let err = client.get_default_branch("acme", "widgets").await.unwrap_err();

        assert!(!err.is_transient(), "expected permanent, got {:?}", err);
    }

    #[test]
    fn test_issue_request_omits_missing_assignee() {
        let request = CreateIssueRequest {
            title: "t",
            body: "b",
            assignees: Vec::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("assignees").is_none());
    }
}
