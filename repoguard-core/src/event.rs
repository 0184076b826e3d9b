//! Inbound event decoding and routing.
//!
//! Only one kind of delivery is acted on: a `repository` event whose action
//! is `created`. Everything else is acknowledged and dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Header carrying the GitHub event type.
pub const EVENT_TYPE_HEADER: &str = "x-github-event";

pub const REPOSITORY_EVENT: &str = "repository";
pub const CREATED_ACTION: &str = "created";

/// One inbound delivery, exactly as received.
#[derive(Debug, Clone, Copy)]
pub struct InboundEvent<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub event_type: Option<&'a str>,
}

/// The repository a recognized event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryIdentity {
    pub owner: String,
    pub name: String,
    /// `None` when the payload carried no (or an empty) default branch.
    pub default_branch: Option<String>,
}

impl RepositoryIdentity {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            default_branch: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// What the router decided to do with a verified delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// A repository was created; run the bootstrap plan against it.
    Recognized(RepositoryIdentity),
    /// Out of scope. Acknowledge and do nothing.
    Skip { reason: String },
    /// Claims to be a repository-created event but cannot be used.
    Malformed { reason: String },
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    name: Option<String>,
    owner: Option<OwnerPayload>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnerPayload {
    login: Option<String>,
}

/// Decide whether a verified delivery should trigger the bootstrap plan.
pub fn route_event(event_type: Option<&str>, body: &[u8]) -> RouteDecision {
    match event_type.map(str::trim) {
        Some(REPOSITORY_EVENT) => {}
        Some(other) => {
            return RouteDecision::Skip {
                reason: format!("unsupported event type '{}'", other),
            }
        }
        None => {
            return RouteDecision::Skip {
                reason: "missing event type header".to_string(),
            }
        }
    }

    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            return RouteDecision::Malformed {
                reason: format!("repository event body is not valid JSON: {}", e),
            }
        }
    };

    let Some(object) = payload.as_object() else {
        return RouteDecision::Malformed {
            reason: "repository event body is not a JSON object".to_string(),
        };
    };

    match object.get("action").and_then(Value::as_str) {
        Some(CREATED_ACTION) => {}
        Some(action) => {
            return RouteDecision::Skip {
                reason: format!("unsupported repository action '{}'", action),
            }
        }
        None => {
            return RouteDecision::Skip {
                reason: "repository event without an action".to_string(),
            }
        }
    }

    let repository = match object.get("repository") {
        Some(value) if !value.is_null() => value.clone(),
        _ => {
            return RouteDecision::Malformed {
                reason: "repository created event without a repository object".to_string(),
            }
        }
    };

    let repository: RepositoryPayload = match serde_json::from_value(repository) {
        Ok(repository) => repository,
        Err(e) => {
            return RouteDecision::Malformed {
                reason: format!("repository object could not be decoded: {}", e),
            }
        }
    };

    let owner = repository
        .owner
        .and_then(|owner| owner.login)
        .filter(|login| !login.trim().is_empty());
    let name = repository.name.filter(|name| !name.trim().is_empty());

    match (owner, name) {
        (Some(owner), Some(name)) => RouteDecision::Recognized(RepositoryIdentity {
            owner,
            name,
            default_branch: repository
                .default_branch
                .filter(|branch| !branch.trim().is_empty()),
        }),
        (None, _) => RouteDecision::Malformed {
            reason: "repository.owner.login is missing or empty".to_string(),
        },
        (_, None) => RouteDecision::Malformed {
            reason: "repository.name is missing or empty".to_string(),
        },
    }
}
