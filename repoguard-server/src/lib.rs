pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod github;
pub mod provider;
pub mod recording;
pub mod secrets;
pub mod webhook;

use reqwest_middleware::ClientWithMiddleware;
use std::sync::Arc;

pub use engine::{handle_event, BootstrapReport, EngineSettings, Invocation, ResponseStatus};
pub use github::{Committer, GitHubClient};
pub use recording::RecordingLogger;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

/// Version string shown in `/help` and the audit issue footer.
pub fn get_version() -> String {
    // Hash injected by the packaging build, if any.
    if let Some(git_hash) = option_env!("REPOGUARD_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        built_info::PKG_VERSION.to_string()
    }
}

/// Shared across requests. Nothing in here is mutated after start-up.
pub struct AppState {
    pub settings: Arc<EngineSettings>,
    pub secrets: Arc<dyn secrets::SecretProvider>,
    /// Connection pool with the recording middleware already attached.
    pub http_client: ClientWithMiddleware,
    pub github_api_url: String,
    pub committer: Option<Committer>,
    pub recording_logger: Option<RecordingLogger>,
}
