use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// One line of the recording log.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,      // RFC 3339
    pub correlation_id: String, // Groups the webhook with the API calls it caused
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String,       // e.g. "webhook", "PUT /repos/acme/widgets/branches/main/protection"
    pub data: serde_json::Value, // Sanitized request/response data
    pub metadata: HashMap<String, String>, // owner, repo, status...
}

impl RecordedEvent {
    /// Build an event stamped with the current time.
    pub fn now(
        correlation_id: &CorrelationId,
        event_type: EventType,
        direction: Direction,
        operation: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.0.clone(),
            event_type,
            direction,
            operation: operation.into(),
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    WebhookReceived,
    GitHubApiCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ServiceType {
    GitHub,
}

impl ServiceType {
    pub fn event_type(self) -> EventType {
        match self {
            ServiceType::GitHub => EventType::GitHubApiCall,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Header used to propagate the correlation ID to GitHub requests.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
