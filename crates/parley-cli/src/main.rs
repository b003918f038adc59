//! `parley` command-line tool.
//!
//! Opens the tracker store described by an endpoints file and inspects
//! the conversations it holds.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing, to stderr)
//! 2. Load endpoints from `endpoints.yml` (or `--endpoints`)
//! 3. Load the domain (or `--domain`), defaulting to an empty one
//! 4. Create the event broker and the fail-safe tracker store
//! 5. Run the subcommand

mod error;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use parley_store::{
    EndpointsConfig, FailSafeTrackerStore, TrackerStore, TrackerStoreRegistry,
    create_event_broker,
};
use parley_types::Domain;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Inspect conversation trackers persisted by Parley")]
#[command(version)]
struct Cli {
    /// Endpoints file describing the tracker store and event broker
    #[arg(long, env = "PARLEY_ENDPOINTS", default_value = "endpoints.yml")]
    endpoints: PathBuf,

    /// Domain file with the slot schema
    #[arg(long)]
    domain: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every conversation id
    Keys,

    /// Print the dialogue of a conversation as JSON
    Show {
        /// Conversation id
        sender_id: String,

        /// Include events from all sessions, not just the latest
        #[arg(long)]
        full: bool,
    },

    /// Report whether a conversation exists
    Exists {
        /// Conversation id
        sender_id: String,
    },

    /// Load a conversation, creating it in the listening state if missing
    Listen {
        /// Conversation id
        sender_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_failure(&e),
    }
}

/// Log a failed run once, on the stderr subscriber.
fn report_failure(error: &CliError) -> ExitCode {
    error!(error = %error, "parley failed");
    ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let endpoints = load_endpoints(&cli.endpoints)?;
    let domain = Arc::new(load_domain(cli.domain.as_deref())?);

    let event_broker = create_event_broker(endpoints.event_broker.as_ref()).await?;
    let primary = TrackerStoreRegistry::new()
        .create(endpoints.tracker_store.as_ref(), Some(domain), event_broker)
        .await?;
    info!(store = primary.name(), "tracker store ready");
    let store = FailSafeTrackerStore::new(primary);

    match cli.command {
        Command::Keys => {
            for sender_id in store.keys().await? {
                println!("{sender_id}");
            }
        }
        Command::Show { sender_id, full } => {
            let tracker = if full {
                store.retrieve_full(&sender_id).await?
            } else {
                store.retrieve(&sender_id).await?
            };
            match tracker {
                Some(tracker) => {
                    println!("{}", serde_json::to_string_pretty(&tracker.as_dialogue())?);
                }
                None => eprintln!("no tracker found for conversation '{sender_id}'"),
            }
        }
        Command::Exists { sender_id } => {
            println!("{}", store.exists(&sender_id).await?);
        }
        Command::Listen { sender_id } => {
            let tracker = store.get_or_create_tracker(&sender_id, None, true).await?;
            println!(
                "{sender_id}: {} events, latest action {}",
                tracker.len(),
                tracker.latest_action_name().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn load_endpoints(path: &Path) -> Result<EndpointsConfig, CliError> {
    if path.exists() {
        debug!(path = %path.display(), "loading endpoints");
        return Ok(EndpointsConfig::from_file(path)?);
    }
    warn!(
        path = %path.display(),
        "endpoints file not found, using the in-memory tracker store"
    );
    let mut endpoints = EndpointsConfig::default();
    endpoints.apply_env_overrides();
    Ok(endpoints)
}

fn load_domain(path: Option<&Path>) -> Result<Domain, CliError> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading domain");
            Ok(Domain::from_file(path)?)
        }
        None => Ok(Domain::empty()),
    }
}
