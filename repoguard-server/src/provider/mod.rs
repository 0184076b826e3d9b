//! The hosting-provider capability the bootstrap plan drives.
//!
//! `RepositoryProvider` is the seven-operation contract the executor relies
//! on. `GitHubClient` implements it over the REST API, `InMemoryProvider`
//! simulates it for tests, and `RetryingProvider` adds backoff on top of
//! either.

mod memory;
mod retry;

pub use memory::{InMemoryProvider, RemoteIssue, RemoteRepository};
pub use retry::{RetryPolicy, RetryingProvider};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repoguard_core::ProtectionRules;
use std::fmt;
use std::time::Duration;

/// Result of `create_branch`. A branch that already exists counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchCreation {
    Created,
    AlreadyExists,
}

/// Result of `put_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCommit {
    Committed { sha: Option<String> },
    /// Someone else wrote the path first.
    AlreadyExists { same_content: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    GetDefaultBranch,
    CreateBranch,
    GetFile,
    PutFile,
    GetBranchProtection,
    SetBranchProtection,
    CreateIssue,
    FindIssueByTitle,
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderOperation::GetDefaultBranch => "getDefaultBranch",
            ProviderOperation::CreateBranch => "createBranch",
            ProviderOperation::GetFile => "getFile",
            ProviderOperation::PutFile => "putFile",
            ProviderOperation::GetBranchProtection => "getBranchProtection",
            ProviderOperation::SetBranchProtection => "setBranchProtection",
            ProviderOperation::CreateIssue => "createIssue",
            ProviderOperation::FindIssueByTitle => "findIssueByTitle",
        };
        f.write_str(name)
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limiting, 5xx, timeouts and connection failures. Worth retrying.
    Transient {
        operation: ProviderOperation,
        message: String,
        /// Server-provided hint for when to try again.
        retry_after: Option<Duration>,
    },
    /// Authorization, missing resources, invalid requests, or a transient
    /// failure that outlived its retries.
    Permanent {
        operation: ProviderOperation,
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn transient(operation: ProviderOperation, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            operation,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(
        operation: ProviderOperation,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        ProviderError::Permanent {
            operation,
            status,
            message: message.into(),
        }
    }

    pub fn with_retry_after(self, delay: Duration) -> Self {
        match self {
            ProviderError::Transient {
                operation, message, ..
            } => ProviderError::Transient {
                operation,
                message,
                retry_after: Some(delay),
            },
            permanent => permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn operation(&self) -> ProviderOperation {
        match self {
            ProviderError::Transient { operation, .. } | ProviderError::Permanent { operation, .. } => {
                *operation
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { .. } => None,
            ProviderError::Permanent { status, .. } => *status,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Transient { retry_after, .. } => *retry_after,
            ProviderError::Permanent { .. } => None,
        }
    }

    /// Turn a transient failure into a permanent one once retries run out.
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            ProviderError::Transient {
                operation, message, ..
            } => ProviderError::Permanent {
                operation,
                status: None,
                message: format!("retries exhausted after {} attempts: {}", attempts, message),
            },
            permanent => permanent,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient {
                operation, message, ..
            } => write!(f, "{} failed (transient): {}", operation, message),
            ProviderError::Permanent {
                operation,
                status: Some(status),
                message,
            } => write!(f, "{} failed with status {}: {}", operation, status, message),
            ProviderError::Permanent {
                operation,
                status: None,
                message,
            } => write!(f, "{} failed: {}", operation, message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Repository, branch, contents, protection and issue operations on the
/// hosting provider.
///
/// Every operation is safe to repeat. Callers read before they write, and
/// "already exists" answers are reported as values rather than errors so a
/// racing duplicate delivery does not fail the plan.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// The repository's default branch, or `None` when it has no branch yet.
    async fn get_default_branch(&self, owner: &str, repo: &str)
        -> Result<Option<String>, ProviderError>;

    /// Create `name`. With no `from_ref` the branch starts from the
    /// repository's initial state.
    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        from_ref: Option<&str>,
    ) -> Result<BranchCreation, ProviderError>;

    /// File content at `path` on `branch`, or `None` if absent.
    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, ProviderError>;

    /// Create `path` on `branch` in a single commit.
    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<FileCommit, ProviderError>;

    /// Current protection rules, or `None` if the branch is unprotected.
    async fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ProtectionRules>, ProviderError>;

    /// Replace the branch's protection rules with `rules`.
    async fn set_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        rules: &ProtectionRules,
    ) -> Result<(), ProviderError>;

    /// Open an issue and return its number.
    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        assignee: Option<&str>,
    ) -> Result<u64, ProviderError>;

    /// Number of an issue titled `title` created at or after `created_since`.
    ///
    /// Only consulted when audit-issue deduplication is enabled. Providers
    /// that cannot search report nothing found, which degrades to always
    /// creating a new issue.
    async fn find_issue_by_title(
        &self,
        _owner: &str,
        _repo: &str,
        _title: &str,
        _created_since: DateTime<Utc>,
    ) -> Result<Option<u64>, ProviderError> {
        Ok(None)
    }
}
