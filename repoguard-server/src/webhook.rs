use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use repoguard_core::{
    CorrelationId, Direction, EventType, InboundEvent, RecordedEvent, Sanitizer,
    CORRELATION_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::{handle_event, Invocation, ResponseStatus};
use crate::github::GitHubClient;
use crate::provider::RepositoryProvider;
use crate::AppState;

/// Transport status for each response class. Accepted deliveries are 2xx so
/// GitHub does not redeliver an event that was handled.
pub fn status_code(status: ResponseStatus) -> StatusCode {
    match status {
        ResponseStatus::AcceptedNoAction | ResponseStatus::AcceptedCompleted => StatusCode::OK,
        ResponseStatus::AcceptedPartialFailure => StatusCode::ACCEPTED,
        ResponseStatus::RejectedInvalidSignature => StatusCode::UNAUTHORIZED,
        ResponseStatus::RejectedMalformed => StatusCode::BAD_REQUEST,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value_str) = value.to_str() {
            map.insert(name.to_string(), value_str.to_string());
        }
    }
    map
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = header(&headers, CORRELATION_ID_HEADER)
        .filter(|id| !id.trim().is_empty())
        .map(|id| CorrelationId(id.to_string()))
        .unwrap_or_else(CorrelationId::generate);

    info!(
        %correlation_id,
        event = header(&headers, EVENT_TYPE_HEADER).unwrap_or("-"),
        "Received webhook delivery"
    );

    let invocation = Invocation::new(state.settings.clone(), state.secrets.clone())
        .with_correlation_id(correlation_id.clone());

    let event = InboundEvent {
        body: &body,
        signature: header(&headers, SIGNATURE_HEADER),
        event_type: header(&headers, EVENT_TYPE_HEADER),
    };

    let connect = |token: &str| -> Arc<dyn RepositoryProvider> {
        Arc::new(
            GitHubClient::new(state.http_client.clone(), state.github_api_url.clone(), token)
                .with_committer(state.committer.clone())
                .with_correlation_id(correlation_id.0.clone()),
        )
    };

    let report = match handle_event(&invocation, event, connect).await {
        Ok(report) => report,
        Err(e) => {
            error!(%correlation_id, "Failed to handle webhook: {:#}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal error",
                    "correlation_id": correlation_id.0,
                })),
            )
                .into_response();
        }
    };

    // Unauthenticated deliveries are not recorded.
    if report.status != ResponseStatus::RejectedInvalidSignature {
        if let Some(ref logger) = state.recording_logger {
            logger.record(
                RecordedEvent::now(
                    &correlation_id,
                    EventType::WebhookReceived,
                    Direction::Request,
                    "webhook",
                    serde_json::json!({
                        "headers": Sanitizer::sanitize_headers(&headers_to_hashmap(&headers)),
                        "body": serde_json::from_slice::<serde_json::Value>(&body)
                            .map(|json| Sanitizer::sanitize_json(&json))
                            .unwrap_or(serde_json::Value::Null),
                    }),
                )
                .with_metadata("status", report.status.to_string()),
            );
        }
    }

    if report.status.is_accepted() {
        info!(%correlation_id, status = %report.status, "Webhook delivery handled");
    } else {
        warn!(%correlation_id, status = %report.status, reason = report.reason.as_deref().unwrap_or("-"), "Webhook delivery rejected");
    }

    (status_code(report.status), Json(report)).into_response()
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(github_webhook_handler))
}
