use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use repoguard_server::config::Config;
use repoguard_server::github::create_github_client;
use repoguard_server::webhook::webhook_router;
use repoguard_server::{AppState, RecordingLogger};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "repoguard"
    })))
}

async fn help_handler() -> Json<serde_json::Value> {
    let version = repoguard_server::get_version();
    Json(json!({
        "service": "repoguard",
        "version": version,
        "description": "Brings newly created repositories under branch protection",
        "endpoints": [
            {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint",
                "authentication": "None",
                "response_format": "application/json"
            },
            {
                "path": "/webhook",
                "method": "POST",
                "description": "GitHub webhook receiver for repository created events",
                "authentication": "GitHub webhook signature (X-Hub-Signature-256)",
                "response_format": "application/json"
            },
            {
                "path": "/help",
                "method": "GET",
                "description": "API documentation and service information",
                "authentication": "None",
                "response_format": "application/json"
            }
        ],
        "responses": {
            "Accepted-NoAction": 200,
            "Accepted-Completed": 200,
            "Accepted-PartialFailure": 202,
            "Rejected-InvalidSignature": 401,
            "Rejected-Malformed": 400
        },
        "configuration": {
            "required_env_vars": [
                "MENTION_USER"
            ],
            "required_secrets": [
                "github_token (GITHUB_TOKEN_SECRET_NAME)",
                "webhook_secret (WEBHOOK_SECRET_NAME)"
            ],
            "optional_env_vars": [
                "PORT (default: 3000)",
                "GITHUB_API_URL (default: https://api.github.com)",
                "DEFAULT_BRANCH (default: main)",
                "PLACEHOLDER_PATH (default: README.md)",
                "PLACEHOLDER_CONTENT_FILE",
                "COMMIT_MESSAGE (default: Initial commit)",
                "COMMITTER_NAME / COMMITTER_EMAIL",
                "REQUIRED_APPROVALS (default: 1)",
                "ENFORCE_ADMINS (default: true)",
                "REQUIRE_CODE_OWNER_REVIEWS (default: true)",
                "AUDIT_ISSUE_TITLE",
                "AUDIT_ISSUE_ASSIGNEE",
                "AUDIT_ISSUE_MODE (default: always)",
                "SECRETS_DIR (default: read secrets from environment)",
                "RETRY_MAX_ATTEMPTS (default: 4)",
                "RETRY_BASE_DELAY_MS (default: 500)",
                "PROVIDER_CALL_TIMEOUT_SECS (default: 10)",
                "PLAN_DEADLINE_SECS (default: 60)",
                "RECORDING_ENABLED (default: false)",
                "RECORDING_LOG_PATH (default: recordings.jsonl)"
            ]
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let version = repoguard_server::get_version();
    info!("Starting repoguard {}", version);

    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    let recording_logger = if config.recording_enabled {
        match RecordingLogger::new(PathBuf::from(&config.recording_log_path)) {
            Ok(logger) => {
                info!("Recording enabled, logging to: {}", config.recording_log_path);
                Some(logger)
            }
            Err(e) => {
                error!("Failed to initialize recording logger: {}", e);
                None
            }
        }
    } else {
        None
    };

    let http_client = create_github_client(recording_logger.clone())?;

    match &config.secrets_dir {
        Some(dir) => info!("Reading secrets from {}", dir.display()),
        None => info!("Reading secrets from environment variables"),
    }

    let app_state = Arc::new(AppState {
        settings: Arc::new(config.engine_settings(version)),
        secrets: config.secret_provider(),
        http_client,
        github_api_url: config.github_api_url.clone(),
        committer: config.committer.clone(),
        recording_logger,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .merge(webhook_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
