use anyhow::{anyhow, Context, Result};
use repoguard_core::audit::DEFAULT_AUDIT_TITLE;
use repoguard_core::policy::{
    DEFAULT_BRANCH, DEFAULT_COMMIT_MESSAGE, DEFAULT_PLACEHOLDER_CONTENT, DEFAULT_PLACEHOLDER_PATH,
};
use repoguard_core::{AuditIssueMode, PolicyConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{EngineSettings, SecretNames, DEFAULT_GITHUB_TOKEN_SECRET, DEFAULT_WEBHOOK_SECRET};
use crate::github::{Committer, DEFAULT_API_URL};
use crate::provider::RetryPolicy;
use crate::secrets::{EnvSecretProvider, FileSecretProvider, SecretProvider};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub github_api_url: String,
    pub policy: PolicyConfig,
    /// Identity used for the placeholder commit. GitHub uses the token's
    /// user when unset.
    pub committer: Option<Committer>,
    /// When set, secrets are read from files in this directory instead of
    /// environment variables.
    pub secrets_dir: Option<PathBuf>,
    pub secret_names: SecretNames,
    pub retry: RetryPolicy,
    pub plan_deadline: Duration,
    pub recording_enabled: bool,
    pub recording_log_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset.
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let github_api_url = var("GITHUB_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let mention_user =
            var("MENTION_USER").context("MENTION_USER environment variable is required")?;

        let mut policy = PolicyConfig::new(mention_user.trim());
        policy.default_branch = var("DEFAULT_BRANCH").unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        policy.placeholder.path =
            var("PLACEHOLDER_PATH").unwrap_or_else(|| DEFAULT_PLACEHOLDER_PATH.to_string());
        policy.placeholder.content = match var("PLACEHOLDER_CONTENT_FILE") {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read PLACEHOLDER_CONTENT_FILE {}", path))?,
            None => DEFAULT_PLACEHOLDER_CONTENT.to_string(),
        };
        policy.placeholder.commit_message =
            var("COMMIT_MESSAGE").unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string());

        policy.protection.required_approvals = var("REQUIRED_APPROVALS")
            .unwrap_or_else(|| "1".to_string())
            .parse::<u32>()
            .context("REQUIRED_APPROVALS must be a valid number")?;
        if policy.protection.required_approvals == 0 {
            return Err(anyhow!("REQUIRED_APPROVALS must be at least 1"));
        }
        policy.protection.enforce_admins = parse_bool("ENFORCE_ADMINS", var("ENFORCE_ADMINS"), true)?;
        policy.protection.require_code_owner_reviews =
            parse_bool("REQUIRE_CODE_OWNER_REVIEWS", var("REQUIRE_CODE_OWNER_REVIEWS"), true)?;

        policy.audit_issue.title =
            var("AUDIT_ISSUE_TITLE").unwrap_or_else(|| DEFAULT_AUDIT_TITLE.to_string());
        policy.audit_issue.assignee = var("AUDIT_ISSUE_ASSIGNEE");
        policy.audit_issue.mode = match var("AUDIT_ISSUE_MODE") {
            Some(mode) => mode
                .parse::<AuditIssueMode>()
                .map_err(|e| anyhow!("AUDIT_ISSUE_MODE: {}", e))?,
            None => AuditIssueMode::default(),
        };

        let committer = match (var("COMMITTER_NAME"), var("COMMITTER_EMAIL")) {
            (Some(name), Some(email)) => Some(Committer { name, email }),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "COMMITTER_NAME and COMMITTER_EMAIL must be set together"
                ))
            }
        };

        let secrets_dir = var("SECRETS_DIR").map(PathBuf::from);
        let secret_names = SecretNames {
            github_token: var("GITHUB_TOKEN_SECRET_NAME")
                .unwrap_or_else(|| DEFAULT_GITHUB_TOKEN_SECRET.to_string()),
            webhook_secret: var("WEBHOOK_SECRET_NAME")
                .unwrap_or_else(|| DEFAULT_WEBHOOK_SECRET.to_string()),
        };

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = var("RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = attempts
                .parse::<u32>()
                .context("RETRY_MAX_ATTEMPTS must be a valid number")?
                .max(1);
        }
        if let Some(ms) = var("RETRY_BASE_DELAY_MS") {
            retry.base_delay = Duration::from_millis(
                ms.parse::<u64>()
                    .context("RETRY_BASE_DELAY_MS must be a valid number")?,
            );
        }
        if let Some(secs) = var("PROVIDER_CALL_TIMEOUT_SECS") {
            retry.call_timeout = Duration::from_secs(
                secs.parse::<u64>()
                    .context("PROVIDER_CALL_TIMEOUT_SECS must be a valid number")?,
            );
        }

        let plan_deadline = Duration::from_secs(
            var("PLAN_DEADLINE_SECS")
                .unwrap_or_else(|| "60".to_string())
                .parse::<u64>()
                .context("PLAN_DEADLINE_SECS must be a valid number")?,
        );

        let recording_enabled = parse_bool("RECORDING_ENABLED", var("RECORDING_ENABLED"), false)?;
        let recording_log_path =
            var("RECORDING_LOG_PATH").unwrap_or_else(|| "recordings.jsonl".to_string());

        Ok(Config {
            port,
            github_api_url,
            policy,
            committer,
            secrets_dir,
            secret_names,
            retry,
            plan_deadline,
            recording_enabled,
            recording_log_path,
        })
    }

    pub fn engine_settings(&self, version: impl Into<String>) -> EngineSettings {
        EngineSettings {
            policy: self.policy.clone(),
            secret_names: self.secret_names.clone(),
            retry: self.retry.clone(),
            plan_deadline: self.plan_deadline,
            version: version.into(),
        }
    }

    pub fn secret_provider(&self) -> Arc<dyn SecretProvider> {
        match &self.secrets_dir {
            Some(dir) => Arc::new(FileSecretProvider::new(dir)),
            None => Arc::new(EnvSecretProvider),
        }
    }
}

/// Parse a boolean flag, accepting `1`/`0`, `yes`/`no` and `on`/`off` as
/// well as `true`/`false`. `default` applies only when the variable is unset.
pub fn parse_bool(name: &str, value: Option<String>, default: bool) -> Result<bool> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false, got {:?}", name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("MENTION_USER", "octocat")]).unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.github_api_url, "https://api.github.com");
        assert_eq!(config.policy.mention_user, "octocat");
        assert_eq!(config.policy.default_branch, "main");
        assert_eq!(config.policy.placeholder.path, "README.md");
        assert_eq!(config.policy.protection.required_approvals, 1);
        assert!(config.policy.protection.enforce_admins);
        assert_eq!(config.policy.audit_issue.mode, AuditIssueMode::Always);
        assert_eq!(config.secret_names, SecretNames::default());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.plan_deadline, Duration::from_secs(60));
        assert!(config.committer.is_none());
        assert!(config.secrets_dir.is_none());
        assert!(!config.recording_enabled);
        assert_eq!(config.recording_log_path, "recordings.jsonl");
    }

    #[test]
    fn test_mention_user_is_required() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("MENTION_USER"));

        let err = config_from(&[("MENTION_USER", "  ")]).unwrap_err();
        assert!(err.to_string().contains("MENTION_USER"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("MENTION_USER", "security-team"),
            ("PORT", "8080"),
            ("GITHUB_API_URL", "https://ghe.example.com/api/v3/"),
            ("DEFAULT_BRANCH", "trunk"),
            ("REQUIRED_APPROVALS", "2"),
            ("ENFORCE_ADMINS", "no"),
            ("AUDIT_ISSUE_MODE", "once-per-day"),
            ("AUDIT_ISSUE_ASSIGNEE", "hubot"),
            ("RETRY_MAX_ATTEMPTS", "6"),
            ("RETRY_BASE_DELAY_MS", "100"),
            ("PLAN_DEADLINE_SECS", "30"),
            ("COMMITTER_NAME", "repoguard"),
            ("COMMITTER_EMAIL", "repoguard@example.com"),
            ("SECRETS_DIR", "/run/secrets"),
            ("RECORDING_ENABLED", "true"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.github_api_url, "https://ghe.example.com/api/v3");
        assert_eq!(config.policy.default_branch, "trunk");
        assert_eq!(config.policy.protection.required_approvals, 2);
        assert!(!config.policy.protection.enforce_admins);
        assert_eq!(config.policy.audit_issue.mode, AuditIssueMode::OncePerDay);
        assert_eq!(config.policy.audit_issue.assignee.as_deref(), Some("hubot"));
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.plan_deadline, Duration::from_secs(30));
        assert_eq!(
            config.committer,
            Some(Committer {
                name: "repoguard".to_string(),
                email: "repoguard@example.com".to_string(),
            })
        );
        assert_eq!(config.secrets_dir, Some(PathBuf::from("/run/secrets")));
        assert!(config.recording_enabled);

        let settings = config.engine_settings("abc123");
        assert_eq!(settings.version, "abc123");
        assert_eq!(settings.policy, config.policy);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("MENTION_USER", "a"), ("PORT", "http")]).is_err());
        assert!(config_from(&[("MENTION_USER", "a"), ("REQUIRED_APPROVALS", "0")]).is_err());
        assert!(config_from(&[("MENTION_USER", "a"), ("AUDIT_ISSUE_MODE", "weekly")]).is_err());
        assert!(config_from(&[("MENTION_USER", "a"), ("COMMITTER_NAME", "only-name")]).is_err());
    }

    #[test]
    fn test_placeholder_content_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("README.md");
        std::fs::write(&path, "# Managed by platform team\n").unwrap();

        let config = config_from(&[
            ("MENTION_USER", "octocat"),
            ("PLACEHOLDER_CONTENT_FILE", path.to_str().unwrap()),
        ])
        .unwrap();
        assert_eq!(config.policy.placeholder.content, "# Managed by platform team\n");

        assert!(config_from(&[
            ("MENTION_USER", "octocat"),
            ("PLACEHOLDER_CONTENT_FILE", "/nonexistent/readme"),
        ])
        .is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("FLAG", Some("TRUE".to_string()), false).unwrap());
        assert!(parse_bool("FLAG", Some("1".to_string()), false).unwrap());
        assert!(!parse_bool("FLAG", Some("off".to_string()), true).unwrap());
        assert!(!parse_bool("FLAG", None, false).unwrap());
        assert!(parse_bool("FLAG", None, true).unwrap());
        assert!(parse_bool("FLAG", Some("maybe".to_string()), true).is_err());
    }

    #[test]
    fn test_misspelt_flag_is_rejected() {
        let err = config_from(&[("MENTION_USER", "octocat"), ("ENFORCE_ADMINS", "flase")]).unwrap_err();
        assert!(err.to_string().contains("ENFORCE_ADMINS"));

        assert!(config_from(&[("MENTION_USER", "octocat"), ("RECORDING_ENABLED", "enabled")]).is_err());
    }
}
