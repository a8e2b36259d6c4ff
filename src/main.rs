use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use worksmith::lock::{LockManager, LockScope};
use worksmith::models::{PlanFeatureInput, PolicyInput};
use worksmith::protocol::{resolve_actor, Op, Request};
use worksmith::vcs::GitVcs;
use worksmith::{Orchestrator, WorkRoot};

#[derive(Parser)]
#[command(name = "wsm")]
#[command(about = "Work-unit orchestration for multi-agent development")]
struct Cli {
    /// Work root directory (defaults to WORKSMITH_ROOT or the platform data dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Acting identity (defaults to WORKSMITH_ACTOR, then the OS user)
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Path to a policy descriptor JSON file (required for mutating commands)
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Git repository the VCS collaborator operates on
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Workspace identity for event streams (defaults to WORKSMITH_WORKSPACE)
    #[arg(long, global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a feature from a JSON description (file path, or stdin with "-")
    Plan { plan: String },
    /// List planned features
    Features,
    /// Read or update project-level configuration
    Config {
        #[arg(long)]
        allow_self_review: Option<bool>,
        #[arg(long)]
        lock_timeout_secs: Option<u64>,
    },
    /// Show a feature graph or a single unit
    Query {
        #[arg(long)]
        feature: Option<Uuid>,
        #[arg(long)]
        unit: Option<Uuid>,
    },
    /// List units whose dependencies are satisfied
    Ready { feature: Uuid },
    /// Claim a unit and allocate its branch and workspace
    Start {
        unit: Uuid,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Pick a rejected unit back up to address review feedback
    Review { unit: Uuid },
    /// Move a unit to another lane
    Transition {
        unit: Uuid,
        to: String,
        #[arg(long)]
        note: Option<String>,
        /// Event id of the review being addressed
        #[arg(long)]
        feedback_ref: Option<Uuid>,
        #[arg(long)]
        force: bool,
    },
    /// Append a note to a unit's history and event stream
    Note { unit: Uuid, note: String },
    /// Accept a finished feature and seal its merged event log
    Accept { feature: Uuid },
    /// Merge all unit branches in dependency order and push
    Merge {
        feature: Uuid,
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Read one full protocol request as JSON from stdin and dispatch it
    Call,
}

/// Stdout carries envelopes, so logs go to stderr.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "worksmith=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_source(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(source)?)
    }
}

fn load_policy(path: Option<&PathBuf>) -> anyhow::Result<Option<PolicyInput>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(Some(serde_json::from_str(&text)?))
        }
        None => Ok(None),
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut store = match cli.root {
        Some(root) => WorkRoot::at(root),
        None => WorkRoot::discover()?,
    };
    if let Some(workspace) = cli.workspace.clone() {
        store = store.with_workspace(workspace);
    }

    // Planning and project administration write directly through the store;
    // everything else goes through the protocol surface.
    match &cli.command {
        Commands::Plan { plan } => {
            let input: PlanFeatureInput = serde_json::from_str(&read_source(plan)?)?;
            let (feature, units) = store.create_feature(input)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "feature_id": feature.id,
                    "units": units.iter().map(|u| (u.title.clone(), u.id)).collect::<Vec<_>>(),
                }))?
            );
            return Ok(());
        }
        Commands::Features => {
            let features = store.list_features()?;
            println!("{}", serde_json::to_string_pretty(&features)?);
            return Ok(());
        }
        Commands::Config {
            allow_self_review,
            lock_timeout_secs,
        } => {
            let locks = LockManager::new(store.path());
            let actor = resolve_actor(cli.actor.clone());
            // One config record per root; the lock resource id is fixed.
            let _guard = locks.acquire(
                LockScope::Config,
                Uuid::nil(),
                &actor,
                Duration::from_secs(30),
            )?;
            let mut config = store.load_config()?;
            if let Some(allow) = allow_self_review {
                config.allow_self_review = *allow;
            }
            if let Some(timeout) = lock_timeout_secs {
                config.lock_timeout_secs = *timeout;
            }
            store.save_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        _ => {}
    }

    let op = match cli.command {
        Commands::Plan { .. } | Commands::Features | Commands::Config { .. } => {
            unreachable!("handled above")
        }
        Commands::Query { feature, unit } => Op::QueryState {
            feature_id: feature,
            unit_id: unit,
        },
        Commands::Ready { feature } => Op::ListReady {
            feature_id: feature,
        },
        Commands::Start { unit, agent } => Op::StartImplementation {
            unit_id: unit,
            agent,
            lock_timeout_secs: None,
        },
        Commands::Review { unit } => Op::StartReview {
            unit_id: unit,
            lock_timeout_secs: None,
        },
        Commands::Transition {
            unit,
            to,
            note,
            feedback_ref,
            force,
        } => Op::Transition {
            unit_id: unit,
            to,
            note,
            feedback_ref,
            force,
            lock_timeout_secs: None,
        },
        Commands::Note { unit, note } => Op::AppendHistory {
            unit_id: unit,
            note,
            lock_timeout_secs: None,
        },
        Commands::Accept { feature } => Op::AcceptFeature {
            feature_id: feature,
            lock_timeout_secs: None,
        },
        Commands::Merge { feature, strategy } => Op::MergeFeature {
            feature_id: feature,
            strategy,
            lock_timeout_secs: None,
        },
        Commands::Call => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            let request: Request = serde_json::from_str(&buf)?;
            let orchestrator = Orchestrator::new(store, Box::new(GitVcs::new(cli.repo)))?;
            let envelope = orchestrator.dispatch(request);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            std::process::exit(if envelope.success { 0 } else { 1 });
        }
    };

    let request = Request {
        contract_version: Some(worksmith::CONTRACT_VERSION.to_string()),
        correlation_id: None,
        actor: cli.actor,
        policy: load_policy(cli.policy.as_ref())?,
        op,
    };

    let orchestrator = Orchestrator::new(store, Box::new(GitVcs::new(cli.repo)))?;
    let envelope = orchestrator.dispatch(request);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    std::process::exit(if envelope.success { 0 } else { 1 });
}
