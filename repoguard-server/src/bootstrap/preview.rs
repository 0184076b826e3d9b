//! Dry-run of a bootstrap plan: reads remote state and reports what each
//! step would do, without performing any mutation.

use chrono::Utc;
use repoguard_core::plan::{
    decide_audit_issue, decide_default_branch, decide_initial_commit, decide_protection,
    desired_branch_name,
};
use repoguard_core::{AuditIssueMode, BootstrapPlan, PolicyConfig, RepositoryIdentity, Step, StepAction};
use serde::Serialize;

use super::executor::start_of_day;
use crate::provider::{ProviderError, RepositoryProvider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub step: Step,
    pub would_change: bool,
    pub action: String,
}

pub async fn preview_plan(
    provider: &dyn RepositoryProvider,
    policy: &PolicyConfig,
    repository: &RepositoryIdentity,
    plan: &BootstrapPlan,
) -> Result<Vec<PreviewEntry>, ProviderError> {
    let (owner, name) = (repository.owner.as_str(), repository.name.as_str());

    let current = provider.get_default_branch(owner, name).await?;
    let desired = desired_branch_name(repository.default_branch.as_deref(), policy);
    let branch_action = decide_default_branch(current.as_deref(), desired);
    let branch = current.unwrap_or_else(|| desired.to_string());
    let branch_exists = branch_action.is_noop();

    // Nothing can be read from a branch that does not exist yet.
    let (file, rules) = if branch_exists {
        (
            provider
                .get_file(owner, name, &branch, &policy.placeholder.path)
                .await?,
            provider.get_branch_protection(owner, name, &branch).await?,
        )
    } else {
        (None, None)
    };
    let (diff, protection_action) = decide_protection(&policy.protection, &branch, rules.as_ref());

    let template = &policy.audit_issue;
    let existing_issue = match template.mode {
        AuditIssueMode::OncePerDay => {
            provider
                .find_issue_by_title(owner, name, &template.title, start_of_day(Utc::now()))
                .await?
        }
        AuditIssueMode::Always => None,
    };

    let mut entries = Vec::with_capacity(plan.len());
    for &step in plan.steps() {
        let action = match step {
            Step::EnsureDefaultBranch => branch_action.clone(),
            Step::EnsureInitialCommit => decide_initial_commit(file.as_deref(), &branch, &policy.placeholder),
            Step::EnsureBranchProtection
            | Step::EnsurePullRequestRequirement
            | Step::EnsureApprovalCount => {
                if step.differs_in(&diff) {
                    protection_action.clone()
                } else {
                    StepAction::NoOp
                }
            }
            Step::EnsureAuditIssue => decide_audit_issue(template.mode, &template.title, existing_issue),
        };

        entries.push(PreviewEntry {
            step,
            would_change: !action.is_noop(),
            action: describe_action(step, &action, policy, &branch),
        });
    }

    Ok(entries)
}

fn describe_action(step: Step, action: &StepAction, policy: &PolicyConfig, branch: &str) -> String {
    match action {
        StepAction::NoOp => format!("already satisfied: {}", step.describe(policy, branch)),
        StepAction::CreateBranch { name } => format!("create branch `{}`", name),
        StepAction::CommitPlaceholder { branch, path, .. } => {
            format!("commit `{}` to `{}`", path, branch)
        }
        StepAction::UpdateProtection { .. } => format!("update protection: {}", step.describe(policy, branch)),
        StepAction::CreateIssue { title } => format!("open issue \"{}\"", title),
    }
}
