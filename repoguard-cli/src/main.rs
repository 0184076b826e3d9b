use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use repoguard_core::{
    sign_payload, BootstrapPlan, RepositoryIdentity, StepOutcome, CORRELATION_ID_HEADER,
    EVENT_TYPE_HEADER, SIGNATURE_HEADER,
};
use repoguard_server::bootstrap::{execute_plan, preview_plan, EngineState, PlanContext};
use repoguard_server::config::Config;
use repoguard_server::github::{create_github_client, GitHubClient};
use repoguard_server::provider::{RepositoryProvider, RetryingProvider};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// repoguard: bootstrap governance on newly created repositories
#[derive(Parser, Debug)]
#[command(name = "repoguard")]
#[command(about = "Sign and replay webhook deliveries, or run the bootstrap plan by hand", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the X-Hub-Signature-256 value for a payload file
    Sign(SignArgs),
    /// POST a signed payload to a running repoguard server
    Replay(ReplayArgs),
    /// Preview (or with --apply, run) the bootstrap plan against a repository
    Plan(PlanArgs),
}

#[derive(Parser, Debug)]
struct SignArgs {
    /// Webhook signing secret
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    secret: String,

    /// File containing the exact payload bytes
    payload: PathBuf,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Webhook endpoint, e.g. http://localhost:3000/webhook
    #[arg(long, default_value = "http://localhost:3000/webhook")]
    url: String,

    /// Webhook signing secret
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    secret: String,

    /// Value of the X-GitHub-Event header
    #[arg(long, default_value = "repository")]
    event: String,

    /// Correlation ID to send, so the run can be found in the server logs
    #[arg(long)]
    correlation_id: Option<String>,

    /// File containing the exact payload bytes
    payload: PathBuf,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Repository owner (organization or user)
    #[arg(long)]
    owner: String,

    /// Repository name
    #[arg(long)]
    repo: String,

    /// Perform the changes instead of only reporting them
    #[arg(long)]
    apply: bool,

    /// GitHub token with administration and contents write access
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// User tagged in the audit issue
    #[arg(long, env = "MENTION_USER")]
    mention_user: String,

    /// Branch to create if the repository has none (overrides DEFAULT_BRANCH)
    #[arg(long)]
    default_branch: Option<String>,
}

fn read_payload(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read payload from {}", path.display()))
}

fn run_sign(args: SignArgs) -> Result<()> {
    let body = read_payload(&args.payload)?;
    println!("{}", sign_payload(&args.secret, &body));
    Ok(())
}

async fn run_replay(client: &reqwest::Client, args: ReplayArgs) -> Result<()> {
    let body = read_payload(&args.payload)?;
    let signature = sign_payload(&args.secret, &body);

    let mut request = client
        .post(&args.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(EVENT_TYPE_HEADER, &args.event)
        .header(SIGNATURE_HEADER, signature);
    if let Some(correlation_id) = &args.correlation_id {
        request = request.header(CORRELATION_ID_HEADER, correlation_id);
    }

    let response = request
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to POST to {}", args.url))?;

    let status = response.status();
    let text = response.text().await.context("Failed to read response body")?;
    println!("HTTP {}", status);
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }

    if status.is_client_error() || status.is_server_error() {
        return Err(anyhow!("delivery was rejected with {}", status));
    }
    Ok(())
}

async fn run_plan(args: PlanArgs) -> Result<()> {
    // Policy knobs come from the same environment variables as the server.
    let config = Config::from_lookup(|name| match name {
        "MENTION_USER" => Some(args.mention_user.clone()),
        "DEFAULT_BRANCH" => args
            .default_branch
            .clone()
            .or_else(|| std::env::var(name).ok()),
        _ => std::env::var(name).ok(),
    })
    .context("Failed to load configuration")?;

    let http_client = create_github_client(None)?;
    let github: Arc<dyn RepositoryProvider> = Arc::new(
        GitHubClient::new(http_client, config.github_api_url.clone(), args.token.clone())
            .with_committer(config.committer.clone()),
    );
    let provider = RetryingProvider::new(github, config.retry.clone());

    let repository = RepositoryIdentity::new(args.owner.clone(), args.repo.clone());
    let plan = BootstrapPlan::from_policy(&config.policy);

    if !args.apply {
        let entries = preview_plan(&provider, &config.policy, &repository, &plan)
            .await
            .context("Failed to read current repository state")?;

        println!("Plan for {} (dry run, pass --apply to execute):", repository);
        for entry in &entries {
            let marker = if entry.would_change { "change" } else { "ok" };
            println!("  [{:>6}] {}: {}", marker, entry.step, entry.action);
        }
        return Ok(());
    }

    let version = repoguard_server::get_version();
    let ctx = PlanContext {
        provider: &provider,
        policy: &config.policy,
        repository: &repository,
        version: &version,
        deadline: Instant::now() + config.plan_deadline,
    };
    let outcome = execute_plan(&ctx, &plan).await;

    println!("Bootstrap of {}:", repository);
    for report in &outcome.steps {
        let resource = report
            .result
            .resource
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        match &report.result.outcome {
            StepOutcome::Failed(reason) => println!("  {}: FAILED: {}", report.step, reason),
            outcome => println!("  {}: {}{}", report.step, outcome, resource),
        }
    }

    match (outcome.state, outcome.failed_step) {
        (EngineState::Completed, _) => Ok(()),
        (_, Some(step)) => Err(anyhow!("bootstrap aborted at {}", step)),
        (state, None) => Err(anyhow!("bootstrap ended in state {}", state)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    match cli.command {
        Commands::Sign(args) => run_sign(args),
        Commands::Replay(args) => run_replay(&client, args).await,
        Commands::Plan(args) => run_plan(args).await,
    }
}
