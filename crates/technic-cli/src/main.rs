mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::request::RequestSubcommand;
use std::path::PathBuf;
use technic_core::types::Decision;

#[derive(Parser)]
#[command(
    name = "technic",
    about = "Access lifecycle orchestration: approval-gated group, software and mailbox actions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Installation root (default: auto-detect from .technic/)
    #[arg(long, global = true, env = "TECHNIC_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .technic/ with a config template and an empty request store
    Init,

    /// Validate the configuration and backend setup
    Check,

    /// Create and inspect access requests
    Request {
        #[command(subcommand)]
        subcommand: RequestSubcommand,
    },

    /// Record an owner's approval
    Approve {
        /// Request id
        id: String,
        /// Owner identity
        #[arg(long)]
        owner: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Record an owner's rejection
    Reject {
        /// Request id
        id: String,
        /// Owner identity
        #[arg(long)]
        owner: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Run one orchestration pass now
    Tick,

    /// Run orchestration passes at the configured cadence until Ctrl-C
    Run {
        /// Override scheduler.cadence_minutes
        #[arg(long)]
        cadence_minutes: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Tick => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Check => cmd::check::run(&root, cli.json),
        Commands::Request { subcommand } => cmd::request::run(&root, subcommand, cli.json),
        Commands::Approve { id, owner, comment } => {
            cmd::approval::run(&root, &id, &owner, Decision::Approved, comment, cli.json)
        }
        Commands::Reject { id, owner, comment } => {
            cmd::approval::run(&root, &id, &owner, Decision::Rejected, comment, cli.json)
        }
        Commands::Tick => cmd::tick::run(&root, cli.json),
        Commands::Run { cadence_minutes } => cmd::run::run(&root, cadence_minutes),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
