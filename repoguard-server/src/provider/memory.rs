//! In-memory implementation of `RepositoryProvider`.
//!
//! Simulates the GitHub behaviours the bootstrap plan depends on (empty
//! repositories, first commits creating the branch, "already exists"
//! conflicts) and counts every call so tests can assert on writes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repoguard_core::ProtectionRules;
use tokio::sync::Mutex;

use super::{BranchCreation, FileCommit, ProviderError, ProviderOperation, RepositoryProvider};

/// Simulated remote state of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRepository {
    /// Advertised default branch. May name a branch that does not exist yet.
    pub default_branch: Option<String>,
    /// Branch name to files (path to content).
    pub branches: BTreeMap<String, BTreeMap<String, String>>,
    pub protection: BTreeMap<String, ProtectionRules>,
    pub issues: Vec<RemoteIssue>,
    pub commits: u64,
}

impl RemoteRepository {
    /// A freshly created repository with no commits.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A repository with one (empty) branch that is also the default.
    pub fn with_branch(name: &str) -> Self {
        let mut repo = Self::default();
        repo.default_branch = Some(name.to_string());
        repo.branches.insert(name.to_string(), BTreeMap::new());
        repo.commits = 1;
        repo
    }

    pub fn with_file(mut self, branch: &str, path: &str, content: &str) -> Self {
        self.branches
            .entry(branch.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_protection(mut self, branch: &str, rules: ProtectionRules) -> Self {
        self.protection.insert(branch.to_string(), rules);
        self
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<&str> {
        self.branches
            .get(branch)
            .and_then(|files| files.get(path))
            .map(String::as_str)
    }

    fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    repositories: HashMap<(String, String), RemoteRepository>,
    calls: HashMap<ProviderOperation, usize>,
    failures: HashMap<ProviderOperation, VecDeque<ProviderError>>,
}

/// In-memory provider.
///
/// State is held behind a single `Mutex`; nothing is persisted.
pub struct InMemoryProvider {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            latency: None,
        }
    }

    /// Delay every call by `latency`, for deadline tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn insert_repository(&self, owner: &str, repo: &str, repository: RemoteRepository) {
        self.state
            .lock()
            .await
            .repositories
            .insert(key(owner, repo), repository);
    }

    /// Snapshot of a repository's simulated state.
    pub async fn repository(&self, owner: &str, repo: &str) -> Option<RemoteRepository> {
        self.state
            .lock()
            .await
            .repositories
            .get(&key(owner, repo))
            .cloned()
    }

    /// Make the next call to `operation` fail with `error`. Queued failures
    /// are consumed in order.
    pub async fn fail_next(&self, operation: ProviderOperation, error: ProviderError) {
        self.state
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub async fn call_count(&self, operation: ProviderOperation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_calls(&self) -> usize {
        self.state.lock().await.calls.values().sum()
    }

    /// Count the call, apply latency, and pop any scripted failure.
    async fn begin(&self, operation: ProviderOperation) -> Result<(), ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn key(owner: &str, repo: &str) -> (String, String) {
    (owner.to_string(), repo.to_string())
}

fn not_found(operation: ProviderOperation, what: String) -> ProviderError {
    ProviderError::permanent(operation, Some(404), format!("{} not found", what))
}

fn lookup<'a>(
    state: &'a mut MemoryState,
    operation: ProviderOperation,
    owner: &str,
    repo: &str,
) -> Result<&'a mut RemoteRepository, ProviderError> {
    state
        .repositories
        .get_mut(&key(owner, repo))
        .ok_or_else(|| not_found(operation, format!("repository {}/{}", owner, repo)))
}

#[async_trait]
impl RepositoryProvider for InMemoryProvider {
    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<Option<String>, ProviderError> {
        let op = ProviderOperation::GetDefaultBranch;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        Ok(repository
            .default_branch
            .clone()
            .filter(|branch| repository.branches.contains_key(branch)))
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        from_ref: Option<&str>,
    ) -> Result<BranchCreation, ProviderError> {
        let op = ProviderOperation::CreateBranch;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        if repository.branches.contains_key(name) {
            return Ok(BranchCreation::AlreadyExists);
        }

        let source = match from_ref {
            Some(reference) => Some(
                repository
                    .branches
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| {
                        ProviderError::permanent(op, Some(422), format!("reference {} does not exist", reference))
                    })?,
            ),
            None => repository
                .default_branch
                .as_ref()
                .and_then(|default| repository.branches.get(default))
                .or_else(|| repository.branches.values().next())
                .cloned(),
        };

        match source {
            Some(files) => {
                repository.branches.insert(name.to_string(), files);
            }
            None => {
                // Empty repository: the first commit creates the branch.
                if repository.default_branch.is_none() {
                    repository.default_branch = Some(name.to_string());
                }
            }
        }

        Ok(BranchCreation::Created)
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, ProviderError> {
        let op = ProviderOperation::GetFile;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;
        Ok(repository.file(branch, path).map(str::to_string))
    }

    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<FileCommit, ProviderError> {
        let op = ProviderOperation::PutFile;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        if !repository.branches.contains_key(branch) {
            if !repository.is_empty() {
                return Err(not_found(op, format!("branch {}", branch)));
            }
            repository.branches.insert(branch.to_string(), BTreeMap::new());
            repository.default_branch = Some(branch.to_string());
        }

        if let Some(existing) = repository.file(branch, path) {
            return Ok(FileCommit::AlreadyExists {
                same_content: existing == content,
            });
        }

        repository.commits += 1;
        let sha = format!("{:040x}", repository.commits);
        repository
            .branches
            .entry(branch.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());

        Ok(FileCommit::Committed { sha: Some(sha) })
    }

    async fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ProtectionRules>, ProviderError> {
        let op = ProviderOperation::GetBranchProtection;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        if !repository.branches.contains_key(branch) {
            return Err(not_found(op, format!("branch {}", branch)));
        }
        Ok(repository.protection.get(branch).cloned())
    }

    async fn set_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        rules: &ProtectionRules,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::SetBranchProtection;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        if !repository.branches.contains_key(branch) {
            return Err(not_found(op, format!("branch {}", branch)));
        }
        repository.protection.insert(branch.to_string(), rules.clone());
        Ok(())
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
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        let number = repository.issues.len() as u64 + 1;
        repository.issues.push(RemoteIssue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            assignee: assignee.map(str::to_string),
            created_at: Utc::now(),
        });
        Ok(number)
    }

    async fn find_issue_by_title(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        created_since: DateTime<Utc>,
    ) -> Result<Option<u64>, ProviderError> {
        let op = ProviderOperation::FindIssueByTitle;
        self.begin(op).await?;
        let mut state = self.state.lock().await;
        let repository = lookup(&mut state, op, owner, repo)?;

        Ok(repository
            .issues
            .iter()
            .filter(|issue| issue.title == title && issue.created_at >= created_since)
            .map(|issue| issue.number)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_repository_branch_materialises_on_first_commit() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::empty())
            .await;

        assert_eq!(provider.get_default_branch("acme", "widgets").await, Ok(None));
        assert_eq!(
            provider.create_branch("acme", "widgets", "main", None).await,
            Ok(BranchCreation::Created)
        );
        // Still no branch until something is committed.
        assert_eq!(provider.get_default_branch("acme", "widgets").await, Ok(None));

        let commit = provider
            .put_file("acme", "widgets", "main", "README.md", "hello", "Initial commit")
            .await
            .unwrap();
        assert!(matches!(commit, FileCommit::Committed { sha: Some(_) }));
        assert_eq!(
            provider.get_default_branch("acme", "widgets").await,
            Ok(Some("main".to_string()))
        );
    }

    #[tokio::test]
    async fn test_branch_from_existing_head_copies_files() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository(
                "acme",
                "widgets",
                RemoteRepository::with_branch("trunk").with_file("trunk", "README.md", "x"),
            )
            .await;

        assert_eq!(
            provider.create_branch("acme", "widgets", "main", None).await,
            Ok(BranchCreation::Created)
        );
        assert_eq!(
            provider.create_branch("acme", "widgets", "main", Some("trunk")).await,
            Ok(BranchCreation::AlreadyExists)
        );
        let repo = provider.repository("acme", "widgets").await.unwrap();
        assert_eq!(repo.file("main", "README.md"), Some("x"));
    }

    #[tokio::test]
    async fn test_put_file_conflict_reports_content_match() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository(
                "acme",
                "widgets",
                RemoteRepository::with_branch("main").with_file("main", "README.md", "mine"),
            )
            .await;

        let same = provider
            .put_file("acme", "widgets", "main", "README.md", "mine", "msg")
            .await;
        let different = provider
            .put_file("acme", "widgets", "main", "README.md", "theirs", "msg")
            .await;

        assert_eq!(same, Ok(FileCommit::AlreadyExists { same_content: true }));
        assert_eq!(different, Ok(FileCommit::AlreadyExists { same_content: false }));
        let repo = provider.repository("acme", "widgets").await.unwrap();
        assert_eq!(repo.file("main", "README.md"), Some("mine"));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        provider
            .fail_next(
                ProviderOperation::GetFile,
                ProviderError::permanent(ProviderOperation::GetFile, Some(401), "Bad credentials"),
            )
            .await;

        let first = provider.get_file("acme", "widgets", "main", "README.md").await;
        let second = provider.get_file("acme", "widgets", "main", "README.md").await;

        assert_eq!(first.unwrap_err().status(), Some(401));
        assert_eq!(second, Ok(None));
        assert_eq!(provider.call_count(ProviderOperation::GetFile).await, 2);
        assert_eq!(provider.total_calls().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_repository_is_permanent_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider.get_default_branch("acme", "missing").await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_find_issue_by_title_respects_since() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        let before = Utc::now() - chrono::Duration::hours(1);
        let number = provider
            .create_issue("acme", "widgets", "Audit", "body", Some("octocat"))
            .await
            .unwrap();

        assert_eq!(
            provider.find_issue_by_title("acme", "widgets", "Audit", before).await,
            Ok(Some(number))
        );
        assert_eq!(
            provider
                .find_issue_by_title("acme", "widgets", "Audit", Utc::now() + chrono::Duration::hours(1))
                .await,
            Ok(None)
        );
        assert_eq!(
            provider.find_issue_by_title("acme", "widgets", "Other", before).await,
            Ok(None)
        );
    }
}
