//! # SailSync CLI (`sailsync`)
//!
//! ## Usage
//!
//! ```bash
//! sailsync --config ./config/sailsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sailsync init` | Create the SQLite database and run schema migrations |
//! | `sailsync sync` | Run one sync over the configured feed |
//! | `sailsync runs` | Recent sync runs with an error preview |
//! | `sailsync run <id>` | One sync run with every error |
//! | `sailsync coverage` | Catalog completeness and the stub review queue |
//! | `sailsync search [text]` | Filtered sailing search |
//! | `sailsync sailing <id>` | One sailing with itinerary and prices |
//! | `sailsync review confirm <kind> <external-id>` | Confirm a reviewed stub |
//! | `sailsync serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! sailsync init
//! sailsync sync --feed ./incoming --progress json
//! sailsync search --cabin inside --price-max-cents 50000 --sort price
//! sailsync review confirm ship SHIP-42
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sailsync::progress::ProgressMode;
use sailsync::search::SearchArgs;
use sailsync::{config, coverage, migrate, runs, search, server};

/// SailSync: cruise feed reconciliation, sync run tracking, and sailing search.
#[derive(Parser)]
#[command(name = "sailsync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sailsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run one sync over the feed.
    ///
    /// Each file is validated, its references resolved to canonical
    /// entities, and the sailing upserted. Bad files are skipped and
    /// recorded on the run; Ctrl-C cancels after in-flight files finish.
    Sync {
        /// Validate every file without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Read this directory instead of the configured feed.
        #[arg(long)]
        feed: Option<PathBuf>,

        /// Progress on stderr: off, human, or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// List recent sync runs.
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one sync run with all of its errors.
    Run { id: String },

    /// Show catalog coverage and the oldest pending stubs.
    Coverage {
        /// How many of the oldest stubs to list.
        #[arg(long)]
        oldest: Option<usize>,
    },

    /// Search sailings.
    Search(SearchArgs),

    /// Show one sailing by internal or external id.
    Sailing { id: String },

    /// Stub review actions.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ReviewAction {
    /// Mark a stub as reviewed and confirmed.
    Confirm {
        /// cruise_line, ship, port, or region
        kind: String,
        external_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sailsync=info,sailsync_core=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Sync {
            dry_run,
            feed,
            progress,
        } => {
            let cfg = match feed {
                Some(dir) => cfg.with_feed_root(dir),
                None => cfg,
            };
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(s) => match ProgressMode::parse(s) {
                    Some(mode) => mode,
                    None => bail!("Unknown progress mode: '{s}'. Use off, human, or json."),
                },
            };
            runs::run_sync(&cfg, dry_run, mode).await?;
        }
        Commands::Runs { limit } => {
            runs::run_list(&cfg, limit).await?;
        }
        Commands::Run { id } => {
            runs::run_show(&cfg, &id).await?;
        }
        Commands::Coverage { oldest } => {
            coverage::run_coverage(&cfg, oldest).await?;
        }
        Commands::Search(args) => {
            search::run_search(&cfg, args).await?;
        }
        Commands::Sailing { id } => {
            search::run_sailing(&cfg, &id).await?;
        }
        Commands::Review {
            action: ReviewAction::Confirm { kind, external_id },
        } => {
            coverage::run_confirm(&cfg, &kind, &external_id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
