//! Pure building blocks of the repository bootstrap engine: webhook
//! verification, event routing, the governance policy and the bootstrap plan.
//! Nothing in this crate performs network I/O.

pub mod audit;
pub mod event;
pub mod plan;
pub mod policy;
pub mod recording;
pub mod signature;

pub use audit::{AuditContext, AuditIssueMode, AuditIssueTemplate};
pub use event::{
    route_event, InboundEvent, RepositoryIdentity, RouteDecision, EVENT_TYPE_HEADER,
};
pub use plan::{BootstrapPlan, Step, StepAction, StepOutcome, StepReport, StepResult};
pub use policy::{
    ActorList, BranchSettings, PlaceholderFile, PolicyConfig, ProtectionDiff, ProtectionPolicy,
    ProtectionRules, PullRequestReviewRules, StatusCheckRules,
};
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, Sanitizer, ServiceType,
    CORRELATION_ID_HEADER,
};
pub use signature::{sign_payload, verify_signature, Verification, SIGNATURE_HEADER};
