//! Executes a `BootstrapPlan` against a provider.
//!
//! This is the impure half of the orchestrator: each step reads remote
//! state, asks the pure decision functions in `repoguard_core::plan` what to
//! do, performs at most one mutation, and reports a tagged outcome. The first
//! permanent failure stops the plan; whatever was applied stays applied.

use chrono::{DateTime, Utc};
use repoguard_core::plan::{
    decide_audit_issue, decide_default_branch, decide_initial_commit, decide_protection,
    desired_branch_name,
};
use repoguard_core::{
    AuditContext, AuditIssueMode, BootstrapPlan, PolicyConfig, ProtectionDiff, RepositoryIdentity, Step,
    StepAction, StepOutcome, StepReport, StepResult,
};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::state::{transition, EngineState, Signal};
use crate::provider::{BranchCreation, FileCommit, ProviderError, RepositoryProvider};

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Everything a plan run needs. Built once per invocation.
pub struct PlanContext<'a> {
    pub provider: &'a dyn RepositoryProvider,
    pub policy: &'a PolicyConfig,
    pub repository: &'a RepositoryIdentity,
    /// Version string for the audit issue footer.
    pub version: &'a str,
    /// No step starts after this instant, and the running step is cut off.
    pub deadline: Instant,
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    /// `Completed` or `Aborted`.
    pub state: EngineState,
    /// One entry per step that ran, in order.
    pub steps: Vec<StepReport>,
    pub failed_step: Option<Step>,
}

impl PlanOutcome {
    pub fn failure_reason(&self) -> Option<&str> {
        self.steps.iter().find_map(|report| match &report.result.outcome {
            StepOutcome::Failed(reason) => Some(reason.as_str()),
            _ => None,
        })
    }
}

/// Facts learned by earlier steps that later steps depend on.
#[derive(Default)]
struct PlanRun {
    /// The default branch, once known or created.
    branch: Option<String>,
    /// Shared by the three protection steps.
    protection: Option<ProtectionDiff>,
    reports: Vec<StepReport>,
}

pub async fn execute_plan(ctx: &PlanContext<'_>, plan: &BootstrapPlan) -> PlanOutcome {
    let repo = ctx.repository;
    let mut run = PlanRun::default();
    let mut state = transition(EngineState::Planning, Signal::PlanBuilt { steps: plan.len() });
    let mut failed_step = None;

    for &step in plan.steps() {
        if Instant::now() >= ctx.deadline {
            warn!(%repo, %step, "Deadline passed before step could start");
            run.reports.push(StepReport {
                step,
                result: StepResult::failed(DEADLINE_EXCEEDED),
            });
            failed_step = Some(step);
            state = transition(state, Signal::DeadlineExceeded);
            break;
        }

        let result = match tokio::time::timeout_at(ctx.deadline, run_step(ctx, &mut run, step)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => StepResult::failed(e.to_string()),
            Err(_) => StepResult::failed(DEADLINE_EXCEEDED),
        };

        let failed = result.outcome.is_failed();
        match &result.outcome {
            StepOutcome::Failed(reason) => {
                error!(%repo, %step, "Step failed: {}", reason)
            }
            outcome => info!(%repo, %step, %outcome, resource = ?result.resource, "Step resolved"),
        }

        run.reports.push(StepReport { step, result });

        if failed {
            failed_step = Some(step);
            state = transition(state, Signal::StepFailed);
            break;
        }
        state = transition(state, Signal::StepResolved);
    }

    PlanOutcome {
        state,
        steps: run.reports,
        failed_step,
    }
}

async fn run_step(ctx: &PlanContext<'_>, run: &mut PlanRun, step: Step) -> Result<StepResult, ProviderError> {
    match step {
        Step::EnsureDefaultBranch => ensure_default_branch(ctx, run).await,
        Step::EnsureInitialCommit => ensure_initial_commit(ctx, run).await,
        Step::EnsureBranchProtection
        | Step::EnsurePullRequestRequirement
        | Step::EnsureApprovalCount => {
            let diff = ensure_protection(ctx, run).await?;
            Ok(if step.differs_in(&diff) {
                StepResult::applied()
            } else {
                StepResult::already_satisfied()
            })
        }
        Step::EnsureAuditIssue => ensure_audit_issue(ctx, run).await,
    }
}

/// The branch later steps operate on. Falls back to a fresh lookup when the
/// plan does not start with `EnsureDefaultBranch`.
async fn branch(ctx: &PlanContext<'_>, run: &mut PlanRun) -> Result<String, ProviderError> {
    if let Some(branch) = &run.branch {
        return Ok(branch.clone());
    }
    let repo = ctx.repository;
    let branch = match ctx.provider.get_default_branch(&repo.owner, &repo.name).await? {
        Some(existing) => existing,
        None => desired_branch_name(repo.default_branch.as_deref(), ctx.policy).to_string(),
    };
    run.branch = Some(branch.clone());
    Ok(branch)
}

async fn ensure_default_branch(ctx: &PlanContext<'_>, run: &mut PlanRun) -> Result<StepResult, ProviderError> {
    let repo = ctx.repository;
    let current = ctx.provider.get_default_branch(&repo.owner, &repo.name).await?;
    let desired = desired_branch_name(repo.default_branch.as_deref(), ctx.policy);

    match decide_default_branch(current.as_deref(), desired) {
        StepAction::CreateBranch { name } => {
            let creation = ctx
                .provider
                .create_branch(&repo.owner, &repo.name, &name, None)
                .await?;
            if creation == BranchCreation::AlreadyExists {
                info!(%repo, branch = %name, "Branch appeared concurrently, treating as applied");
            }
            run.branch = Some(name.clone());
            Ok(StepResult::applied().with_resource(name))
        }
        _ => {
            let existing = current.unwrap_or_else(|| desired.to_string());
            run.branch = Some(existing.clone());
            Ok(StepResult::already_satisfied().with_resource(existing))
        }
    }
}

async fn ensure_initial_commit(ctx: &PlanContext<'_>, run: &mut PlanRun) -> Result<StepResult, ProviderError> {
    let repo = ctx.repository;
    let branch = branch(ctx, run).await?;
    let placeholder = &ctx.policy.placeholder;

    let existing = ctx
        .provider
        .get_file(&repo.owner, &repo.name, &branch, &placeholder.path)
        .await?;

    match decide_initial_commit(existing.as_deref(), &branch, placeholder) {
        StepAction::CommitPlaceholder {
            branch,
            path,
            content,
            message,
        } => {
            let commit = ctx
                .provider
                .put_file(&repo.owner, &repo.name, &branch, &path, &content, &message)
                .await?;
            Ok(match commit {
                FileCommit::Committed { sha: Some(sha) } => StepResult::applied().with_resource(sha),
                FileCommit::Committed { sha: None } => StepResult::applied(),
                FileCommit::AlreadyExists { same_content } => {
                    info!(%repo, %path, same_content, "File appeared concurrently, treating as applied");
                    StepResult::applied()
                }
            })
        }
        _ => Ok(StepResult::already_satisfied()),
    }
}

/// Read the current rules once, and send one combined update if anything
/// falls short. The diff is cached for the two protection steps that follow.
async fn ensure_protection(ctx: &PlanContext<'_>, run: &mut PlanRun) -> Result<ProtectionDiff, ProviderError> {
    if let Some(diff) = run.protection {
        return Ok(diff);
    }

    let repo = ctx.repository;
    let branch = branch(ctx, run).await?;
    let current = ctx
        .provider
        .get_branch_protection(&repo.owner, &repo.name, &branch)
        .await?;

    let (diff, action) = decide_protection(&ctx.policy.protection, &branch, current.as_ref());
    if let StepAction::UpdateProtection { branch, rules } = action {
        info!(%repo, %branch, ?diff, "Applying combined branch protection update");
        ctx.provider
            .set_branch_protection(&repo.owner, &repo.name, &branch, &rules)
            .await?;
    }

    run.protection = Some(diff);
    Ok(diff)
}

pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

async fn ensure_audit_issue(ctx: &PlanContext<'_>, run: &mut PlanRun) -> Result<StepResult, ProviderError> {
    let repo = ctx.repository;
    let template = &ctx.policy.audit_issue;
    let branch = branch(ctx, run).await?;

    let existing = match template.mode {
        AuditIssueMode::OncePerDay => {
            ctx.provider
                .find_issue_by_title(&repo.owner, &repo.name, &template.title, start_of_day(Utc::now()))
                .await?
        }
        AuditIssueMode::Always => None,
    };

    let StepAction::CreateIssue { title } = decide_audit_issue(template.mode, &template.title, existing) else {
        let number = existing.map(|n| format!("#{}", n));
        info!(%repo, issue = ?number, "Audit issue already filed today");
        let result = StepResult::already_satisfied();
        return Ok(match number {
            Some(number) => result.with_resource(number),
            None => result,
        });
    };

    let mut applied = Vec::new();
    let mut satisfied = Vec::new();
    for report in &run.reports {
        let line = report.step.describe(ctx.policy, &branch);
        match report.result.outcome {
            StepOutcome::Applied => applied.push(line),
            StepOutcome::AlreadySatisfied => satisfied.push(line),
            StepOutcome::Failed(_) => {}
        }
    }

    let repository = repo.full_name();
    let body = template.render_body(&AuditContext {
        repository: &repository,
        applied: &applied,
        satisfied: &satisfied,
        mention_user: &ctx.policy.mention_user,
        version: ctx.version,
    });

    let number = ctx
        .provider
        .create_issue(&repo.owner, &repo.name, &title, &body, template.assignee.as_deref())
        .await?;

    Ok(StepResult::applied().with_resource(format!("#{}", number)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InMemoryProvider, ProviderOperation, RemoteRepository};
    use repoguard_core::ProtectionPolicy;
    use std::time::Duration;

    fn identity() -> RepositoryIdentity {
        RepositoryIdentity::new("acme", "widgets")
    }

    async fn run_plan(provider: &InMemoryProvider, policy: &PolicyConfig) -> PlanOutcome {
        let repository = identity();
        let ctx = PlanContext {
            provider,
            policy,
            repository: &repository,
            version: "test",
            deadline: Instant::now() + Duration::from_secs(5),
        };
        execute_plan(&ctx, &BootstrapPlan::from_policy(policy)).await
    }

    fn outcomes(outcome: &PlanOutcome) -> Vec<StepOutcome> {
        outcome.steps.iter().map(|r| r.result.outcome.clone()).collect()
    }

    #[tokio::test]
    async fn test_existing_branch_gets_protection_and_issue() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository(
                "acme",
                "widgets",
                RemoteRepository::with_branch("trunk").with_file("trunk", "README.md", "hi"),
            )
            .await;
        let policy = PolicyConfig::new("octocat");

        let outcome = run_plan(&provider, &policy).await;

        assert_eq!(outcome.state, EngineState::Completed);
        assert_eq!(
            outcomes(&outcome),
            vec![
                StepOutcome::AlreadySatisfied,
                StepOutcome::AlreadySatisfied,
                StepOutcome::Applied,
                StepOutcome::Applied,
                StepOutcome::Applied,
                StepOutcome::Applied,
            ]
        );
        assert_eq!(outcome.steps[0].result.resource.as_deref(), Some("trunk"));

        let repo = provider.repository("acme", "widgets").await.unwrap();
        assert!(repo.protection.contains_key("trunk"));
        assert_eq!(provider.call_count(ProviderOperation::CreateBranch).await, 0);
        assert_eq!(provider.call_count(ProviderOperation::SetBranchProtection).await, 1);
    }

    #[tokio::test]
    async fn test_only_the_short_field_group_is_applied() {
        let policy = PolicyConfig::new("octocat");
        let mut rules = policy.protection.merge(None);
        if let Some(reviews) = rules.pull_request_reviews.as_mut() {
            reviews.required_approving_review_count = 0;
        }

        let provider = InMemoryProvider::new();
        provider
            .insert_repository(
                "acme",
                "widgets",
                RemoteRepository::with_branch("main")
                    .with_file("main", "README.md", "hi")
                    .with_protection("main", rules),
            )
            .await;

        let outcome = run_plan(&provider, &policy).await;

        assert_eq!(
            &outcomes(&outcome)[2..5],
            &[
                StepOutcome::AlreadySatisfied,
                StepOutcome::AlreadySatisfied,
                StepOutcome::Applied,
            ]
        );
        assert_eq!(provider.call_count(ProviderOperation::GetBranchProtection).await, 1);
        assert_eq!(provider.call_count(ProviderOperation::SetBranchProtection).await, 1);
    }

    #[tokio::test]
    async fn test_protection_read_failure_skips_later_protection_steps() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        provider
            .fail_next(
                ProviderOperation::GetBranchProtection,
                ProviderError::permanent(ProviderOperation::GetBranchProtection, Some(401), "Bad credentials"),
            )
            .await;

        let outcome = run_plan(&provider, &PolicyConfig::new("octocat")).await;

        assert_eq!(outcome.state, EngineState::Aborted);
        assert_eq!(outcome.failed_step, Some(Step::EnsureBranchProtection));
        assert_eq!(outcome.steps.len(), 3);
        assert!(outcome.failure_reason().unwrap().contains("401"));
        assert_eq!(provider.call_count(ProviderOperation::CreateIssue).await, 0);
    }

    #[tokio::test]
    async fn test_audit_issue_lists_applied_and_satisfied_steps() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository(
                "acme",
                "widgets",
                RemoteRepository::with_branch("main").with_file("main", "README.md", "hi"),
            )
            .await;
        let mut policy = PolicyConfig::new("octocat");
        policy.audit_issue.assignee = Some("hubot".to_string());
        policy.protection = ProtectionPolicy {
            required_approvals: 2,
            ..Default::default()
        };

        run_plan(&provider, &policy).await;

        let repo = provider.repository("acme", "widgets").await.unwrap();
        assert_eq!(repo.issues.len(), 1);
        let issue = &repo.issues[0];
        assert_eq!(issue.title, "Repository automatically protected");
        assert_eq!(issue.assignee.as_deref(), Some("hubot"));
        assert!(issue.body.contains("- At least 2 approving reviews"));
        assert!(issue.body.contains("### Already in place\n- Default branch `main`"));
        assert!(issue.body.contains("Tagging @octocat"));
    }

    #[tokio::test]
    async fn test_once_per_day_mode_reuses_todays_issue() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        let mut policy = PolicyConfig::new("octocat");
        policy.audit_issue.mode = AuditIssueMode::OncePerDay;

        let first = run_plan(&provider, &policy).await;
        let second = run_plan(&provider, &policy).await;

        assert_eq!(first.steps[5].result, StepResult::applied().with_resource("#1"));
        assert_eq!(
            second.steps[5].result,
            StepResult::already_satisfied().with_resource("#1")
        );
        assert_eq!(provider.call_count(ProviderOperation::CreateIssue).await, 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_before_first_step() {
        let provider = InMemoryProvider::new();
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        let policy = PolicyConfig::new("octocat");
        let repository = identity();
        let ctx = PlanContext {
            provider: &provider,
            policy: &policy,
            repository: &repository,
            version: "test",
            deadline: Instant::now(),
        };

        let outcome = execute_plan(&ctx, &BootstrapPlan::from_policy(&policy)).await;

        assert_eq!(outcome.state, EngineState::Aborted);
        assert_eq!(outcome.failed_step, Some(Step::EnsureDefaultBranch));
        assert_eq!(outcome.failure_reason(), Some(DEADLINE_EXCEEDED));
        assert_eq!(provider.total_calls().await, 0);
    }

    #[tokio::test]
    async fn test_deadline_cuts_off_slow_step() {
        let provider = InMemoryProvider::new().with_latency(Duration::from_millis(40));
        provider
            .insert_repository("acme", "widgets", RemoteRepository::with_branch("main"))
            .await;
        let policy = PolicyConfig::new("octocat");
        let repository = identity();
        let ctx = PlanContext {
            provider: &provider,
            policy: &policy,
            repository: &repository,
            version: "test",
            deadline: Instant::now() + Duration::from_millis(100),
        };

        let outcome = execute_plan(&ctx, &BootstrapPlan::from_policy(&policy)).await;

        assert_eq!(outcome.state, EngineState::Aborted);
        assert!(outcome.steps.len() < 6);
        assert_eq!(outcome.failure_reason(), Some(DEADLINE_EXCEEDED));
        assert!(outcome.steps[0].result.outcome == StepOutcome::AlreadySatisfied);
    }

    #[test]
    fn test_start_of_day() {
        let now = DateTime::parse_from_rfc3339("2024-05-17T13:45:12Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(start_of_day(now).to_rfc3339(), "2024-05-17T00:00:00+00:00");
    }
}
