//! `healer` CLI: start the HTTP surface, drive one run directly from
//! the command line, or inspect GitHub App / PAT credential status.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use healer::config::Config;
use healer::credential::CredentialBroker;
use healer::events::BroadcastEventSink;
use healer::http::{self, AppState};
use healer::orchestrator::{make_branch_name, Orchestrator, RunRequest};
use healer::types::RunStatus;

/// Autonomous CI/CD healing service: clones a repo, runs its tests,
/// synthesizes and verifies fixes, publishes on green.
#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Autonomous CI/CD healing service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    config: Config,

    /// Enable debug-level tracing.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP surface (`/run-agent`, `/runs`, `/ws/{id}`, admin
    /// auth endpoints).
    Serve,
    /// Run one healing pass directly, without the HTTP surface. Useful
    /// for local/CI use.
    Run {
        /// `https://github.com/<owner>/<repo>` URL to heal.
        #[arg(long)]
        repository_url: String,

        /// Team name, used in the branch name and results document.
        #[arg(long)]
        team_name: String,

        /// Leader name, used in the branch name and results document.
        #[arg(long)]
        leader_name: String,
    },
    /// Credential Broker inspection.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Report which auth method is configured, without contacting GitHub.
    Status,
    /// Resolve a token for `owner/repo` and report which method
    /// satisfied it, never the token itself.
    Check {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { EnvFilter::new("healer=debug,info") } else { EnvFilter::new("healer=info,warn") };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve => serve(cli.config).await,
        Commands::Run { repository_url, team_name, leader_name } => run_once(cli.config, repository_url, team_name, leader_name).await,
        Commands::Auth { action } => auth(cli.config, action).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let credential = Arc::new(CredentialBroker::new(config.clone()));
    let events = Arc::new(BroadcastEventSink::new());
    let reasoner = healer::reasoner_client::HttpReasonerClient::from_config(&config)?;
    let orchestrator = Arc::new(Orchestrator::new(config, credential.clone(), events.clone(), Arc::new(reasoner)));
    let state = Arc::new(AppState::new(orchestrator, credential, events));

    http::run_server(state, &bind_addr).await.context("HTTP surface exited with an error")
}

async fn run_once(config: Config, repository_url: String, team_name: String, leader_name: String) -> Result<()> {
    let credential = Arc::new(CredentialBroker::new(config.clone()));
    let events = Arc::new(BroadcastEventSink::new());
    let reasoner = healer::reasoner_client::HttpReasonerClient::from_config(&config)?;
    let orchestrator = Orchestrator::new(config, credential, events, Arc::new(reasoner));

    let branch_name = make_branch_name(&team_name, &leader_name);
    println!("{} {} -> branch {}", "healing".bold(), repository_url, branch_name.cyan());

    let request = RunRequest { run_id: uuid::Uuid::new_v4().to_string(), repository_url, team_name, leader_name };
    let doc = orchestrator.run(request).await;

    match doc.final_status {
        RunStatus::Passed => println!("{} in {} ({} fix(es) applied)", "PASSED".green().bold(), doc.total_time, doc.total_fixes),
        RunStatus::Failed => println!("{} after {}", "FAILED".red().bold(), doc.total_time),
    }
    println!("{}", serde_json::to_string_pretty(&doc)?);

    if doc.final_status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn auth(config: Config, action: AuthAction) -> Result<()> {
    let broker = CredentialBroker::new(config);
    match action {
        AuthAction::Status => {
            println!("auth_method:        {}", broker.auth_method().yellow());
            println!("github_app_configured: {}", broker.is_app_configured());
            println!("pat_available:       {}", broker.has_fallback());
        }
        AuthAction::Check { owner, repo } => match broker.resolve_token(&owner, &repo).await {
            Ok((_token, method)) => println!("{owner}/{repo}: resolved via {method:?}"),
            Err(e) => {
                println!("{owner}/{repo}: {} ({e})", "unresolved".red());
                std::process::exit(1);
            }
        },
    }
    Ok(())
}
