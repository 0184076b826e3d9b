//! One invocation of the bootstrap engine: verify, route, plan, execute.
//!
//! Everything an invocation needs is carried in an immutable `Invocation`
//! built per request, so handlers and tests never touch process-wide state.

use anyhow::{Context, Result};
use repoguard_core::{
    route_event, verify_signature, BootstrapPlan, CorrelationId, InboundEvent, PolicyConfig,
    RouteDecision, Step, StepReport,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{execute_plan, transition, EngineState, PlanContext, Signal};
use crate::provider::{RepositoryProvider, RetryPolicy, RetryingProvider};
use crate::secrets::SecretProvider;

pub const DEFAULT_PLAN_DEADLINE: Duration = Duration::from_secs(60);
pub const DEFAULT_GITHUB_TOKEN_SECRET: &str = "github_token";
pub const DEFAULT_WEBHOOK_SECRET: &str = "webhook_secret";

/// Names under which the two required secrets are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretNames {
    pub github_token: String,
    pub webhook_secret: String,
}

impl Default for SecretNames {
    fn default() -> Self {
        Self {
            github_token: DEFAULT_GITHUB_TOKEN_SECRET.to_string(),
            webhook_secret: DEFAULT_WEBHOOK_SECRET.to_string(),
        }
    }
}

/// Process-wide settings, loaded once at start-up and shared read-only.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: PolicyConfig,
    pub secret_names: SecretNames,
    pub retry: RetryPolicy,
    /// Budget for a whole invocation, from receipt to the last step.
    pub plan_deadline: Duration,
    pub version: String,
}

impl EngineSettings {
    pub fn new(policy: PolicyConfig, version: impl Into<String>) -> Self {
        Self {
            policy,
            secret_names: SecretNames::default(),
            retry: RetryPolicy::default(),
            plan_deadline: DEFAULT_PLAN_DEADLINE,
            version: version.into(),
        }
    }
}

/// Context for a single delivery.
#[derive(Clone)]
pub struct Invocation {
    pub settings: Arc<EngineSettings>,
    pub secrets: Arc<dyn SecretProvider>,
    pub correlation_id: CorrelationId,
    pub deadline: Instant,
}

impl Invocation {
    pub fn new(settings: Arc<EngineSettings>, secrets: Arc<dyn SecretProvider>) -> Self {
        let deadline = Instant::now() + settings.plan_deadline;
        Self {
            settings,
            secrets,
            correlation_id: CorrelationId::generate(),
            deadline,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// The five response classes of a delivery that got past secret retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseStatus {
    #[serde(rename = "Accepted-NoAction")]
    AcceptedNoAction,
    #[serde(rename = "Accepted-Completed")]
    AcceptedCompleted,
    #[serde(rename = "Accepted-PartialFailure")]
    AcceptedPartialFailure,
    #[serde(rename = "Rejected-InvalidSignature")]
    RejectedInvalidSignature,
    #[serde(rename = "Rejected-Malformed")]
    RejectedMalformed,
}

impl ResponseStatus {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            ResponseStatus::AcceptedNoAction
                | ResponseStatus::AcceptedCompleted
                | ResponseStatus::AcceptedPartialFailure
        )
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseStatus::AcceptedNoAction => "Accepted-NoAction",
            ResponseStatus::AcceptedCompleted => "Accepted-Completed",
            ResponseStatus::AcceptedPartialFailure => "Accepted-PartialFailure",
            ResponseStatus::RejectedInvalidSignature => "Rejected-InvalidSignature",
            ResponseStatus::RejectedMalformed => "Rejected-Malformed",
        };
        f.write_str(name)
    }
}

/// Structured result of one invocation, returned to the caller as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub correlation_id: String,
}

impl BootstrapReport {
    fn new(status: ResponseStatus, invocation: &Invocation) -> Self {
        Self {
            status,
            repository: None,
            steps: Vec::new(),
            failed_step: None,
            reason: None,
            correlation_id: invocation.correlation_id.to_string(),
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Handle one inbound delivery.
///
/// `connect` builds the provider from the API token once the event is known
/// to need one; it is never called for rejected or skipped deliveries.
///
/// Every `Ok` report carries one of the five [`ResponseStatus`] classes. An
/// `Err` is the one outcome outside them: a secret could not be fetched,
/// nothing was executed, and the front door answers 500 so the delivery is
/// redelivered rather than acknowledged.
pub async fn handle_event<C>(
    invocation: &Invocation,
    event: InboundEvent<'_>,
    connect: C,
) -> Result<BootstrapReport>
where
    C: FnOnce(&str) -> Arc<dyn RepositoryProvider>,
{
    let settings = &invocation.settings;
    let correlation_id = &invocation.correlation_id;
    let mut state = transition(EngineState::Idle, Signal::RequestReceived);

    let webhook_secret = invocation
        .secrets
        .get_secret(&settings.secret_names.webhook_secret)
        .await
        .context("Failed to fetch webhook signing secret")?;

    if !verify_signature(&webhook_secret, event.body, event.signature).is_valid() {
        state = transition(state, Signal::SignatureInvalid);
        warn!(%correlation_id, %state, "Rejecting delivery with invalid signature");
        return Ok(BootstrapReport::new(ResponseStatus::RejectedInvalidSignature, invocation)
            .with_reason("invalid signature"));
    }
    state = transition(state, Signal::SignatureValid);

    let repository = match route_event(event.event_type, event.body) {
        RouteDecision::Recognized(repository) => {
            state = transition(state, Signal::EventRecognized);
            repository
        }
        RouteDecision::Skip { reason } => {
            state = transition(state, Signal::EventIgnored);
            info!(%correlation_id, %state, "Ignoring delivery: {}", reason);
            return Ok(BootstrapReport::new(ResponseStatus::AcceptedNoAction, invocation)
                .with_reason(reason));
        }
        RouteDecision::Malformed { reason } => {
            state = transition(state, Signal::EventIgnored);
            warn!(%correlation_id, %state, "Malformed repository event: {}", reason);
            return Ok(BootstrapReport::new(ResponseStatus::RejectedMalformed, invocation)
                .with_reason(reason));
        }
    };

    info!(%correlation_id, %repository, "Bootstrapping newly created repository");

    let token = invocation
        .secrets
        .get_secret(&settings.secret_names.github_token)
        .await
        .context("Failed to fetch GitHub API token")?;

    let provider = RetryingProvider::new(connect(&token), settings.retry.clone());
    let plan = BootstrapPlan::from_policy(&settings.policy);
    let ctx = PlanContext {
        provider: &provider,
        policy: &settings.policy,
        repository: &repository,
        version: &settings.version,
        deadline: invocation.deadline,
    };

    debug!(%correlation_id, %state, steps = plan.len(), "Executing bootstrap plan");
    let outcome = execute_plan(&ctx, &plan).await;

    let status = match outcome.state {
        EngineState::Completed => ResponseStatus::AcceptedCompleted,
        _ => ResponseStatus::AcceptedPartialFailure,
    };

    match outcome.failed_step {
        Some(step) => error!(
            %correlation_id,
            %repository,
            %step,
            "Bootstrap aborted: {}",
            outcome.failure_reason().unwrap_or("unknown")
        ),
        None => info!(%correlation_id, %repository, steps = outcome.steps.len(), "Bootstrap completed"),
    }

    let reason = outcome.failure_reason().map(str::to_string);
    Ok(BootstrapReport {
        status,
        repository: Some(repository.full_name()),
        steps: outcome.steps,
        failed_step: outcome.failed_step,
        reason,
        correlation_id: correlation_id.to_string(),
    })
}
