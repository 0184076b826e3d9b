//! Retry with exponential backoff for provider calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repoguard_core::ProtectionRules;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{BranchCreation, FileCommit, ProviderError, ProviderOperation, RepositoryProvider};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on each individual attempt. A timed-out attempt is transient.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or runs out of
    /// attempts.
    pub async fn run<T, F, Fut>(&self, operation: ProviderOperation, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::transient(
                    operation,
                    format!("timed out after {:?}", self.call_timeout),
                ),
            };

            if attempt >= attempts {
                return Err(error.escalate(attempt));
            }

            let delay = error
                .retry_after()
                .map(|hint| hint.min(self.max_delay))
                .unwrap_or_else(|| self.backoff_delay(attempt));

            warn!(
                %operation,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                "Transient provider failure, retrying: {}",
                error
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Applies a `RetryPolicy` to every call of an inner provider.
pub struct RetryingProvider {
    inner: Arc<dyn RepositoryProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn RepositoryProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl RepositoryProvider for RetryingProvider {
    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<Option<String>, ProviderError> {
        self.policy
            .run(ProviderOperation::GetDefaultBranch, || {
                self.inner.get_default_branch(owner, repo)
            })
            .await
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        from_ref: Option<&str>,
    ) -> Result<BranchCreation, ProviderError> {
        self.policy
            .run(ProviderOperation::CreateBranch, || {
                self.inner.create_branch(owner, repo, name, from_ref)
            })
            .await
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, ProviderError> {
        self.policy
            .run(ProviderOperation::GetFile, || {
                self.inner.get_file(owner, repo, branch, path)
            })
            .await
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
        self.policy
            .run(ProviderOperation::PutFile, || {
                self.inner.put_file(owner, repo, branch, path, content, message)
            })
            .await
    }

    async fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ProtectionRules>, ProviderError> {
        self.policy
            .run(ProviderOperation::GetBranchProtection, || {
                self.inner.get_branch_protection(owner, repo, branch)
            })
            .await
    }

    async fn set_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        rules: &ProtectionRules,
    ) -> Result<(), ProviderError> {
        self.policy
            .run(ProviderOperation::SetBranchProtection, || {
                self.inner.set_branch_protection(owner, repo, branch, rules)
            })
            .await
    }

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        assignee: Option<&str>,
    ) -> Result<u64, ProviderError> {
        self.policy
            .run(ProviderOperation::CreateIssue, || {
                self.inner.create_issue(owner, repo, title, body, assignee)
            })
            .await
    }

    async fn find_issue_by_title(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        created_since: DateTime<Utc>,
    ) -> Result<Option<u64>, ProviderError> {
        self.policy
            .run(ProviderOperation::FindIssueByTitle, || {
                self.inner.find_issue_by_title(owner, repo, title, created_since)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InMemoryProvider, RemoteRepository};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(7), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(200), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run(ProviderOperation::GetFile, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::transient(ProviderOperation::GetFile, "503"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run(ProviderOperation::SetBranchProtection, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::permanent(
                        ProviderOperation::SetBranchProtection,
                        Some(403),
                        "Forbidden",
                    ))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().status(), Some(403));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy()
            .run(ProviderOperation::CreateIssue, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::transient(ProviderOperation::CreateIssue, "429")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("retries exhausted after 4 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out_as_transient() {
        let policy = RetryPolicy {
            max_attempts: 2,
            call_timeout: Duration::from_millis(10),
            ..fast_policy()
        };
        let result: Result<(), _> = policy
            .run(ProviderOperation::GetDefaultBranch, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retrying_provider_wraps_inner_calls() {
        let inner = Arc::new(InMemoryProvider::new());
        inner
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        inner
            .fail_next(
                ProviderOperation::GetDefaultBranch,
                ProviderError::transient(ProviderOperation::GetDefaultBranch, "502"),
            )
            .await;

        let provider = RetryingProvider::new(inner.clone(), fast_policy());
        let branch = provider.get_default_branch("acme", "widgets").await;

        assert_eq!(branch, Ok(Some("main".to_string())));
        assert_eq!(inner.call_count(ProviderOperation::GetDefaultBranch).await, 2);
    }
}
