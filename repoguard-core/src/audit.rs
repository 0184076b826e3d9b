//! The audit issue opened at the end of a bootstrap run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_AUDIT_TITLE: &str = "Repository automatically protected";

pub const DEFAULT_AUDIT_BODY: &str = "\
Repository **{repository}** was bootstrapped automatically on creation.

### Settings applied
{applied}

### Already in place
{satisfied}

Branch protection documentation: \
https://docs.github.com/en/repositories/configuring-branches-and-merges-in-your-repository/managing-protected-branches/about-protected-branches

Tagging {mention}

<sub>repoguard {version}</sub>
";

/// How often an audit issue may be opened for the same repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditIssueMode {
    /// Open a new issue on every run.
    #[default]
    Always,
    /// Reuse an issue with the same title created on the same day.
    OncePerDay,
}

impl FromStr for AuditIssueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "once-per-day" | "once_per_day" | "daily" => Ok(Self::OncePerDay),
            other => Err(format!(
                "unknown audit issue mode '{}' (expected 'always' or 'once-per-day')",
                other
            )),
        }
    }
}

impl fmt::Display for AuditIssueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::OncePerDay => f.write_str("once-per-day"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditIssueTemplate {
    pub title: String,
    /// Placeholders: `{repository}`, `{applied}`, `{satisfied}`, `{mention}`, `{version}`.
    pub body_template: String,
    pub assignee: Option<String>,
    pub mode: AuditIssueMode,
}

impl Default for AuditIssueTemplate {
    fn default() -> Self {
        Self {
            title: DEFAULT_AUDIT_TITLE.to_string(),
            body_template: DEFAULT_AUDIT_BODY.to_string(),
            assignee: None,
            mode: AuditIssueMode::Always,
        }
    }
}

/// Values substituted into the audit body.
#[derive(Debug, Clone)]
pub struct AuditContext<'a> {
    pub repository: &'a str,
    pub applied: &'a [String],
    pub satisfied: &'a [String],
    pub mention_user: &'a str,
    pub version: &'a str,
}

impl AuditIssueTemplate {
    pub fn render_body(&self, ctx: &AuditContext<'_>) -> String {
        let mention = if ctx.mention_user.starts_with('@') {
            ctx.mention_user.to_string()
        } else {
            format!("@{}", ctx.mention_user)
        };

        self.body_template
            .replace("{repository}", ctx.repository)
            .replace("{applied}", &bullet_list(ctx.applied))
            .replace("{satisfied}", &bullet_list(ctx.satisfied))
            .replace("{mention}", &mention)
            .replace("{version}", ctx.version)
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "_None_".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
