//! Secret providers for the API token and webhook signing secret.
//!
//! Secrets are read on every call and never cached, so a rotated value is
//! picked up by the next invocation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Reads each secret from an environment variable named after it,
/// upper-cased with `-` and `.` mapped to `_` (`github_token` -> `GITHUB_TOKEN`).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretProvider;

pub fn env_var_name(secret_name: &str) -> String {
    secret_name
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let var = env_var_name(name);
        let value = std::env::var(&var)
            .with_context(|| format!("{} environment variable is required for secret {}", var, name))?;
        non_empty(name, value)
    }
}

/// Reads each secret from a file of the same name inside a directory, as
/// mounted secret volumes lay them out. Surrounding whitespace is trimmed.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        if name.contains('/') || name.contains('\\') || name == ".." {
            return Err(anyhow!("invalid secret name {:?}", name));
        }

        let path = self.dir.join(name);
        let value = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read secret {} from {}", name, path.display()))?;
        non_empty(name, value.trim().to_string())
    }
}

/// Fixed secrets, for tests and one-off CLI runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("secret {} is not configured", name))
    }
}

fn non_empty(name: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(anyhow!("secret {} is empty", name));
    }
    Ok(value)
}
