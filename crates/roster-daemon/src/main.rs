//! roster-daemon: Headless roster sync for a district.
//!
//! Uses the same roster-core as any other front end, with a file-backed local
//! store and the repository contents API as the remote document store.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use roster_core::{
    ApplicationState, Mutation, PullOutcome, PushOutcome, Roster, SyncEvent, SyncOptions,
};
use roster_daemon::{Config, ContentsClient, FileStore};

type Session = Arc<Roster<FileStore, ContentsClient>>;

#[derive(Parser, Debug)]
#[command(name = "roster-daemon")]
#[command(about = "District roster sync daemon")]
struct Args {
    /// Directory holding config.json and the local state cache
    #[arg(long, global = true, env = "ROSTER_DATA_DIR", default_value = ".roster")]
    data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the local state in sync until interrupted
    Run,
    /// Pull the remote document once
    Pull,
    /// Push the local state once
    Push,
    /// Print a summary of the local state
    Show,
    /// Set connection settings (only the given fields change)
    Configure {
        /// Repository as owner/name
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Document path inside the repository
        #[arg(long)]
        path: Option<String>,
        /// Access token
        #[arg(long, env = "ROSTER_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Allow edits from this device
    Login,
    /// Disallow edits from this device
    Logout,
    /// Post an announcement
    Announce {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
    },
}

fn open_session(data_dir: &Path, config: &Config) -> Result<Session> {
    let remote = ContentsClient::new(&config.api_base, &config.user_agent)
        .context("Failed to build HTTP client")?;
    let local = FileStore::new(data_dir.join("state"));
    let options = SyncOptions {
        poll_interval: config.poll_interval(),
    };
    Ok(Roster::new(local, remote, options))
}

/// Report what happened to a local edit, waiting for its push if one started.
async fn finish(mutation: Mutation) -> Result<()> {
    match mutation {
        Mutation::Rejected => bail!("Not signed in; run `roster-daemon login` first"),
        Mutation::Local => {
            println!("Saved locally (sync not configured)");
            Ok(())
        }
        Mutation::Pushing(push) => match push.await.context("Push task failed")? {
            PushOutcome::Committed { token } => {
                println!("Saved and pushed (version {})", token);
                Ok(())
            }
            PushOutcome::NotConfigured => {
                println!("Saved locally (sync not configured)");
                Ok(())
            }
            PushOutcome::Failed { reason } => bail!("Saved locally, but push failed: {}", reason),
        },
    }
}

fn show(roster: &Session) {
    let state: ApplicationState = roster.state();
    println!("District {}", state.district);
    println!("  Sync:          {}", roster.status().label());
    match state.connection() {
        Some(settings) => println!(
            "  Remote:        {}@{}:{}",
            settings.repo, settings.branch, settings.path
        ),
        None => println!("  Remote:        (not configured)"),
    }
    println!("  Signed in:     {}", roster.is_authorized());
    println!("  Stores:        {}", state.stores.len());
    println!("  Employees:     {}", state.employees.len());
    println!("  Overrides:     {}", state.schedule.len());
    println!("  Change log:    {}", state.logs.len());
    for announcement in state.announcements.iter().take(3) {
        println!("  * {}: {}", announcement.title, announcement.body);
    }
}

async fn run(roster: Session) -> Result<()> {
    if roster.connection().is_none() {
        warn!("Sync is not configured; running local-only. Use `roster-daemon configure`.");
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let _subscription = roster.events().subscribe(move |event| {
        let _ = event_tx.send(event);
    });

    roster.start();
    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    SyncEvent::StatusChanged { status, .. } => info!("Status: {}", status.label()),
                    SyncEvent::PullApplied { token, .. } => {
                        info!("Remote changes applied (version {})", token);
                    }
                    SyncEvent::PullFailed { error, silent: false, .. } => warn!("Pull failed: {}", error),
                    other => debug!("{:?}", other),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    roster.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,roster_daemon=debug,roster_core=debug"
    } else {
        "info,roster_daemon=info,roster_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!("Data directory: {:?}", args.data_dir);
    let config = Config::load(&args.data_dir)?;
    let roster = open_session(&args.data_dir, &config)?;

    match args.command {
        Command::Run => run(roster).await?,
        Command::Pull => match roster.refresh().await {
            PullOutcome::Applied { token } => println!("Applied remote version {}", token),
            PullOutcome::Unchanged => println!("Already up to date"),
            PullOutcome::Missing => println!("No remote document yet; the next push creates it"),
            PullOutcome::Suppressed => println!("Skipped: a push is in flight"),
            PullOutcome::NotConfigured => bail!("Sync is not configured"),
            PullOutcome::Failed { reason } => bail!("Pull failed: {}", reason),
        },
        Command::Push => match roster.push().await {
            PushOutcome::Committed { token } => println!("Pushed version {}", token),
            PushOutcome::NotConfigured => bail!("Sync is not configured"),
            PushOutcome::Failed { reason } => bail!("Push failed: {}", reason),
        },
        Command::Show => show(&roster),
        Command::Configure {
            repo,
            branch,
            path,
            token,
        } => {
            let mutation = roster.update_state(|mut state| {
                let mut settings = state.github.take().unwrap_or_default();
                if let Some(repo) = repo {
                    settings.repo = repo;
                }
                if let Some(branch) = branch {
                    settings.branch = branch;
                }
                if let Some(path) = path {
                    settings.path = path;
                }
                if let Some(token) = token {
                    settings.token = token;
                }
                state.github = Some(settings);
                state
            });
            finish(mutation).await?;
        }
        Command::Login => {
            roster.set_authorized(true);
            println!("Signed in");
        }
        Command::Logout => {
            roster.set_authorized(false);
            println!("Signed out");
        }
        Command::Announce { title, body } => {
            let now = chrono::Utc::now().timestamp_millis();
            let mutation = roster.try_update_state(|state| {
                state.post_announcement(&title, &body, now).map(|_| ())
            })?;
            finish(mutation).await?;
        }
    }

    Ok(())
}
