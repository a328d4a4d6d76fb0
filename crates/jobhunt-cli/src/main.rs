//! jobhunt - coordination CLI for the job-application pipeline
//!
//! Workers call this binary to take lane locks and job claims and to record
//! outcomes in the shared backlog. A scheduler calls `dispatch-status` to
//! pick lanes and `reconcile` to clean up after crashed workers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobhunt_core::config::{self, CONFIG_FILE_NAME, HOME_ENV_VAR, JobhuntConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::CommandContext;
use commands::lock::LockCommand;

/// jobhunt - coordination CLI for the job-application pipeline
#[derive(Parser, Debug)]
#[command(name = "jobhunt")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (default: <home>/jobhunt.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// jobhunt home directory (default: ~/.jobhunt)
    #[arg(long, global = true, env = HOME_ENV_VAR)]
    home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Lanes ===
    /// Check, acquire or release a lane lock
    #[command(subcommand)]
    Lock(LockCommand),

    // === Claims ===
    /// Claim a posting URL for this worker
    Claim {
        /// Posting URL
        url: String,
    },

    /// Release a claim on a posting URL
    Release {
        /// Posting URL
        url: String,
    },

    /// List claims with their age
    ListClaims,

    // === Backlog ===
    /// Record an application and archive the entry
    MarkApplied {
        /// Posting URL
        url: String,
        /// Company (taken from the backlog entry when omitted)
        company: Option<String>,
        /// Role title (taken from the backlog entry when omitted)
        title: Option<String>,
        /// Mark applied even if the entry is not pending or in progress
        #[arg(long)]
        force: bool,
    },

    /// Permanently pass over a posting
    Skip {
        /// Posting URL
        url: String,
        /// Why the posting is skipped
        reason: Option<String>,
    },

    /// Archive completed and skipped entries and rewrite the backlog
    Compact,

    /// Add a discovered posting (JSON object) to the backlog
    Add {
        /// Discovery record as JSON
        record: String,
    },

    /// Check a posting against the dedup index
    CheckDedup {
        /// Posting URL
        url: String,
        /// Company
        company: Option<String>,
        /// Role title
        title: Option<String>,
    },

    /// Rebuild the dedup index from the tracker, backlog and archive
    RebuildDedup,

    // === Maintenance ===
    /// End abandoned runs and heal locks and claims
    Reconcile {
        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show which lanes can be dispatched
    DispatchStatus,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let home = match cli.home.clone() {
        Some(home) => home,
        None => config::jobhunt_home_dir().context("failed to resolve jobhunt home")?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| home.join(CONFIG_FILE_NAME));
    let config = match JobhuntConfig::load_or_default(&config_path) {
        Ok(config) => config.resolve_paths(&home),
        Err(e) => {
            eprintln!("ERROR: {}: {e}", config_path.display());
            std::process::exit(i32::from(commands::exit_codes::INVALID_ARGS));
        },
    };
    let ctx = CommandContext::new(config, cli.json);

    // Commands return precise exit codes; LOCKED and CLAIMED_BY_OTHER are
    // successful answers, not failures.
    let exit_code = match cli.command {
        Commands::Lock(cmd) => commands::lock::run_lock(&cmd, &ctx),
        Commands::Claim { url } => commands::claim::claim(&ctx, &url),
        Commands::Release { url } => commands::claim::release(&ctx, &url),
        Commands::ListClaims => commands::claim::list(&ctx),
        Commands::MarkApplied {
            url,
            company,
            title,
            force,
        } => commands::backlog::mark_applied(
            &ctx,
            &url,
            company.as_deref().unwrap_or_default(),
            title.as_deref().unwrap_or_default(),
            force,
        ),
        Commands::Skip { url, reason } => {
            commands::backlog::skip(&ctx, &url, reason.as_deref().unwrap_or_default())
        },
        Commands::Compact => commands::backlog::compact(&ctx),
        Commands::Add { record } => commands::backlog::add(&ctx, &record),
        Commands::CheckDedup {
            url,
            company,
            title,
        } => commands::backlog::check_dedup(
            &ctx,
            &url,
            company.as_deref().unwrap_or_default(),
            title.as_deref().unwrap_or_default(),
        ),
        Commands::RebuildDedup => commands::backlog::rebuild_dedup(&ctx),
        Commands::Reconcile { dry_run } => commands::reconcile::run_reconcile(&ctx, dry_run),
        Commands::DispatchStatus => commands::dispatch::run_dispatch_status(&ctx),
    };
    std::process::exit(i32::from(exit_code));
}
