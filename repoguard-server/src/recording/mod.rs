//! Optional JSONL recording of webhooks and GitHub API traffic.

pub mod logger;
pub mod middleware;

pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;
pub use repoguard_core::recording::*;
