//! The bootstrap plan: a fixed, ordered list of idempotent steps.
//!
//! Each step is decided by a pure function of the remote state it observed
//! and the desired policy. Executing the decided action is the server's job.

use serde::Serialize;
use std::fmt;

use crate::audit::AuditIssueMode;
use crate::policy::{PlaceholderFile, PolicyConfig, ProtectionDiff, ProtectionPolicy, ProtectionRules};

/// One step of the bootstrap plan.
///
/// The order is load-bearing: protection cannot be set on a branch that does
/// not exist yet, and the audit issue has to see every other outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Step {
    EnsureDefaultBranch,
    EnsureInitialCommit,
    EnsureBranchProtection,
    EnsurePullRequestRequirement,
    EnsureApprovalCount,
    EnsureAuditIssue,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::EnsureDefaultBranch,
        Step::EnsureInitialCommit,
        Step::EnsureBranchProtection,
        Step::EnsurePullRequestRequirement,
        Step::EnsureApprovalCount,
        Step::EnsureAuditIssue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::EnsureDefaultBranch => "EnsureDefaultBranch",
            Step::EnsureInitialCommit => "EnsureInitialCommit",
            Step::EnsureBranchProtection => "EnsureBranchProtection",
            Step::EnsurePullRequestRequirement => "EnsurePullRequestRequirement",
            Step::EnsureApprovalCount => "EnsureApprovalCount",
            Step::EnsureAuditIssue => "EnsureAuditIssue",
        }
    }

    /// Human-readable summary of the setting this step guarantees, used in
    /// the audit issue body.
    pub fn describe(self, policy: &PolicyConfig, branch: &str) -> String {
        let protection = &policy.protection;
        match self {
            Step::EnsureDefaultBranch => format!("Default branch `{}`", branch),
            Step::EnsureInitialCommit => {
                format!("Initial file `{}` on `{}`", policy.placeholder.path, branch)
            }
            Step::EnsureBranchProtection => format!(
                "Branch protection on `{}` (enforce for admins: {}, code owner review: {}, dismiss stale reviews: {})",
                branch,
                yes_no(protection.enforce_admins),
                yes_no(protection.require_code_owner_reviews),
                yes_no(protection.dismiss_stale_reviews),
            ),
            Step::EnsurePullRequestRequirement => {
                "Changes must go through a pull request".to_string()
            }
            Step::EnsureApprovalCount => match protection.required_approvals {
                1 => "At least 1 approving review".to_string(),
                n => format!("At least {} approving reviews", n),
            },
            Step::EnsureAuditIssue => format!("Audit issue \"{}\"", policy.audit_issue.title),
        }
    }

    /// Whether the field group owned by this step differs in `diff`.
    pub fn differs_in(self, diff: &ProtectionDiff) -> bool {
        match self {
            Step::EnsureBranchProtection => diff.protection,
            Step::EnsurePullRequestRequirement => diff.pull_request,
            Step::EnsureApprovalCount => diff.approvals,
            _ => false,
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The ordered steps to run. Rebuilt from configuration on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    steps: Vec<Step>,
}

impl BootstrapPlan {
    pub fn from_policy(_policy: &PolicyConfig) -> Self {
        Self {
            steps: Step::ALL.to_vec(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum StepOutcome {
    Applied,
    AlreadySatisfied,
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Applied => f.write_str("Applied"),
            StepOutcome::AlreadySatisfied => f.write_str("AlreadySatisfied"),
            StepOutcome::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    #[serde(flatten)]
    pub outcome: StepOutcome,
    /// Remote identifier of what the step touched, e.g. `#12` or a commit SHA.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl StepResult {
    pub fn applied() -> Self {
        Self {
            outcome: StepOutcome::Applied,
            resource: None,
        }
    }

    pub fn already_satisfied() -> Self {
        Self {
            outcome: StepOutcome::AlreadySatisfied,
            resource: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Failed(reason.into()),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: Step,
    #[serde(flatten)]
    pub result: StepResult,
}

/// The remote mutation a step decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    NoOp,
    CreateBranch {
        name: String,
    },
    CommitPlaceholder {
        branch: String,
        path: String,
        content: String,
        message: String,
    },
    UpdateProtection {
        branch: String,
        rules: ProtectionRules,
    },
    CreateIssue {
        title: String,
    },
}

impl StepAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, StepAction::NoOp)
    }
}

// =============================================================================
// Step decisions
// =============================================================================

/// The branch to create when the repository has none: the payload's default
/// branch if it named one, otherwise the configured name.
pub fn desired_branch_name<'a>(payload_branch: Option<&'a str>, policy: &'a PolicyConfig) -> &'a str {
    payload_branch
        .filter(|b| !b.trim().is_empty())
        .unwrap_or(&policy.default_branch)
}

pub fn decide_default_branch(current: Option<&str>, desired: &str) -> StepAction {
    match current {
        Some(_) => StepAction::NoOp,
        None => StepAction::CreateBranch {
            name: desired.to_string(),
        },
    }
}

/// Any file already at the placeholder path satisfies the step, whatever its
/// content. User edits are never overwritten.
pub fn decide_initial_commit(
    existing: Option<&str>,
    branch: &str,
    placeholder: &PlaceholderFile,
) -> StepAction {
    match existing {
        Some(_) => StepAction::NoOp,
        None => StepAction::CommitPlaceholder {
            branch: branch.to_string(),
            path: placeholder.path.clone(),
            content: placeholder.content.clone(),
            message: placeholder.commit_message.clone(),
        },
    }
}

/// Decide the combined protection update shared by the three protection steps.
pub fn decide_protection(
    policy: &ProtectionPolicy,
    branch: &str,
    current: Option<&ProtectionRules>,
) -> (ProtectionDiff, StepAction) {
    let diff = policy.diff(current);
    if diff.is_empty() {
        return (diff, StepAction::NoOp);
    }
    (
        diff,
        StepAction::UpdateProtection {
            branch: branch.to_string(),
            rules: policy.merge(current),
        },
    )
}

/// `existing` is only consulted when deduplication is enabled.
pub fn decide_audit_issue(mode: AuditIssueMode, title: &str, existing: Option<u64>) -> StepAction {
    match (mode, existing) {
        (AuditIssueMode::OncePerDay, Some(_)) => StepAction::NoOp,
        _ => StepAction::CreateIssue {
            title: title.to_string(),
        },
    }
}
