//! Repository governance policy and branch-protection diffing.
//!
//! The policy is a floor, not an exact target: an existing rule set that is
//! at least as strict as the policy satisfies it, and updates never weaken a
//! field that is already stricter than required.

use serde::{Deserialize, Serialize};

use crate::audit::AuditIssueTemplate;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_PLACEHOLDER_PATH: &str = "README.md";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Initial commit";
pub const DEFAULT_PLACEHOLDER_CONTENT: &str = "# New repository\n\n\
This file was added automatically when the repository was created.\n\
Replace it with a description of the project.\n";

/// Branch-protection rules as they exist on the provider.
///
/// GitHub replaces the whole rule set on update, so every setting it accepts
/// is modelled here even when the policy has no opinion on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRules {
    pub enforce_admins: bool,
    /// `None` means pull requests are not required.
    pub pull_request_reviews: Option<PullRequestReviewRules>,
    /// Not managed by the policy; carried through on update.
    pub required_status_checks: Option<StatusCheckRules>,
    /// Not managed by the policy; carried through on update.
    pub restrictions: Option<ActorList>,
    /// Not managed by the policy; carried through on update.
    #[serde(default)]
    pub settings: BranchSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestReviewRules {
    pub required_approving_review_count: u32,
    pub require_code_owner_reviews: bool,
    pub dismiss_stale_reviews: bool,
    #[serde(default)]
    pub require_last_push_approval: bool,
    /// Who may dismiss reviews. `None` means anyone with write access.
    #[serde(default)]
    pub dismissal_restrictions: Option<ActorList>,
    /// Who may merge without the required reviews.
    #[serde(default)]
    pub bypass_pull_request_allowances: Option<ActorList>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheckRules {
    pub strict: bool,
    pub contexts: Vec<String>,
}

/// Users (by login), teams and apps (by slug).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorList {
    pub users: Vec<String>,
    pub teams: Vec<String>,
    pub apps: Vec<String>,
}

/// The on/off switches of a rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchSettings {
    pub required_linear_history: bool,
    pub allow_force_pushes: bool,
    pub allow_deletions: bool,
    pub block_creations: bool,
    pub required_conversation_resolution: bool,
    pub lock_branch: bool,
    pub allow_fork_syncing: bool,
}

/// Desired protection for the default branch. Pull requests are always
/// required; the remaining knobs are configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionPolicy {
    pub required_approvals: u32,
    pub enforce_admins: bool,
    pub require_code_owner_reviews: bool,
    pub dismiss_stale_reviews: bool,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self {
            required_approvals: 1,
            enforce_admins: true,
            require_code_owner_reviews: true,
            dismiss_stale_reviews: false,
        }
    }
}

/// Which field groups of the current rules fall short of the policy.
///
/// Each group belongs to one bootstrap step, so the three protection steps
/// can report independently even though they share one remote update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionDiff {
    /// Protection missing, or admin enforcement / review flags too weak.
    pub protection: bool,
    /// Pull-request reviews not required.
    pub pull_request: bool,
    /// Approval count below the minimum.
    pub approvals: bool,
}

impl ProtectionDiff {
    pub fn is_empty(&self) -> bool {
        !(self.protection || self.pull_request || self.approvals)
    }
}

impl ProtectionPolicy {
    /// Compare the current rules (`None` = unprotected) against the policy.
    pub fn diff(&self, current: Option<&ProtectionRules>) -> ProtectionDiff {
        let Some(current) = current else {
            return ProtectionDiff {
                protection: true,
                pull_request: true,
                approvals: self.required_approvals > 0,
            };
        };

        let reviews = current.pull_request_reviews.as_ref();
        let code_owner_reviews = reviews.is_some_and(|r| r.require_code_owner_reviews);
        let dismiss_stale = reviews.is_some_and(|r| r.dismiss_stale_reviews);
        let approvals = reviews.map_or(0, |r| r.required_approving_review_count);

        ProtectionDiff {
            protection: (self.enforce_admins && !current.enforce_admins)
                || (self.require_code_owner_reviews && !code_owner_reviews)
                || (self.dismiss_stale_reviews && !dismiss_stale),
            pull_request: reviews.is_none(),
            approvals: approvals < self.required_approvals,
        }
    }

    /// The rule set to send in a combined update: the current rules raised to
    /// the policy floor, with unmanaged fields left as they were.
    pub fn merge(&self, current: Option<&ProtectionRules>) -> ProtectionRules {
        let mut merged = current.cloned().unwrap_or_default();
        merged.enforce_admins |= self.enforce_admins;

        let reviews = merged.pull_request_reviews.get_or_insert_with(Default::default);
        reviews.required_approving_review_count =
            reviews.required_approving_review_count.max(self.required_approvals);
        reviews.require_code_owner_reviews |= self.require_code_owner_reviews;
        reviews.dismiss_stale_reviews |= self.dismiss_stale_reviews;

        merged
    }
}

/// The initial file committed to a new default branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderFile {
    pub path: String,
    pub content: String,
    pub commit_message: String,
}

impl Default for PlaceholderFile {
    fn default() -> Self {
        Self {
            path: DEFAULT_PLACEHOLDER_PATH.to_string(),
            content: DEFAULT_PLACEHOLDER_CONTENT.to_string(),
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        }
    }
}

/// Everything the bootstrap plan needs to know about the desired state.
/// Loaded once per process and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Branch created when the repository has none.
    pub default_branch: String,
    pub placeholder: PlaceholderFile,
    pub protection: ProtectionPolicy,
    pub audit_issue: AuditIssueTemplate,
    /// User tagged in the audit issue.
    pub mention_user: String,
}

impl PolicyConfig {
    pub fn new(mention_user: impl Into<String>) -> Self {
        Self {
            default_branch: DEFAULT_BRANCH.to_string(),
            placeholder: PlaceholderFile::default(),
            protection: ProtectionPolicy::default(),
            audit_issue: AuditIssueTemplate::default(),
            mention_user: mention_user.into(),
        }
    }
}
