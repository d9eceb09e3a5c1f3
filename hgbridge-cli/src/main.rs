//! hgbridge: bidirectional bridge between hg-style and git-style history.
//!
//! Supports:
//! - Fetching hg bundles into git objects
//! - Pushing git commits out as hg bundles
//! - Identifier translation in both directions
//! - Integrity checks and the sync log
//!
//! # Usage
//!
//! ```bash
//! # Translate a bundle into the bridge repository
//! hgbridge -R /path/to/bridge fetch --bundle incoming.hgb
//!
//! # Push git commits as a bundle into an outbox directory
//! hgbridge -R /path/to/bridge push --outbox ./outbox <git-head>
//!
//! # Look up identifiers
//! hgbridge -R /path/to/bridge hg2git --abbrev <hg-id>
//! hgbridge -R /path/to/bridge git2hg <git-id>
//!
//! # Check the mapping log
//! hgbridge -R /path/to/bridge fsck
//! ```

mod lookup;
mod sync_log;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use hgbridge_core::{AbbrevSize, BridgeRepository, BundleFileRemote, GitId, Orchestrator};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "hgbridge")]
#[command(author = "hgbridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bridge between hg and git history")]
struct Cli {
    /// Bridge repository path
    #[arg(short = 'R', long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert hg changeset ids to git commit ids
    Hg2git {
        /// Abbreviate ids to N hex digits (12 when given without a value)
        #[arg(long, num_args = 0..=1, default_missing_value = "12", require_equals = true)]
        abbrev: Option<AbbrevSize>,
        /// hg changeset ids, full or abbreviated
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Convert git commit ids to hg changeset ids
    Git2hg {
        /// Abbreviate ids to N hex digits (12 when given without a value)
        #[arg(long, num_args = 0..=1, default_missing_value = "12", require_equals = true)]
        abbrev: Option<AbbrevSize>,
        /// git commit ids, full or abbreviated
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Dump the stored text of an hg revision (a file revision by default)
    Data {
        /// The id is a changeset
        #[arg(short = 'c', conflicts_with = "manifest")]
        changeset: bool,
        /// The id is a manifest
        #[arg(short = 'm')]
        manifest: bool,
        /// Revision id
        id: String,
    },

    /// Fetch a bundle and translate it into git commits
    Fetch {
        /// Bundle file to read
        #[arg(short, long)]
        bundle: PathBuf,
    },

    /// Translate git commits and write them as a bundle
    Push {
        /// Directory receiving the bundle
        #[arg(short, long)]
        outbox: PathBuf,
        /// git heads to push
        #[arg(required = true)]
        heads: Vec<String>,
    },

    /// Audit the correspondence log
    Fsck,

    /// Display bridge status and information
    Info,

    /// View the sync log
    Log {
        /// Show only the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Remove entries older than this many days
        #[arg(long)]
        cleanup_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hgbridge=info".parse()?)
                .add_directive("hgbridge_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo = cli.repo.as_path();

    match cli.command {
        Commands::Hg2git { abbrev, ids } => {
            let repository = open(repo)?;
            let abbrev = abbrev.unwrap_or(AbbrevSize::FULL);
            lookup::hg2git(&repository, &ids, abbrev, &mut std::io::stdout().lock())
        }

        Commands::Git2hg { abbrev, ids } => {
            let repository = open(repo)?;
            let abbrev = abbrev.unwrap_or(AbbrevSize::FULL);
            lookup::git2hg(&repository, &ids, abbrev, &mut std::io::stdout().lock())
        }

        Commands::Data {
            changeset,
            manifest,
            id,
        } => {
            let kind = match (changeset, manifest) {
                (true, _) => lookup::DataKind::Changeset,
                (_, true) => lookup::DataKind::Manifest,
                _ => lookup::DataKind::File,
            };
            let repository = open(repo)?;
            let mut stdout = std::io::stdout().lock();
            lookup::data(&repository, kind, &id, &mut stdout)?;
            stdout.flush()?;
            Ok(())
        }

        Commands::Fetch { bundle } => cmd_fetch(repo, bundle).await,

        Commands::Push { outbox, heads } => cmd_push(repo, outbox, heads).await,

        Commands::Fsck => cmd_fsck(repo),

        Commands::Info => cmd_info(repo),

        Commands::Log {
            limit,
            cleanup_days,
        } => cmd_log(repo, limit, cleanup_days),
    }
}

fn open(repo: &Path) -> Result<BridgeRepository> {
    tracing::debug!(path = %repo.display(), "opening bridge repository");
    BridgeRepository::open(repo)
        .with_context(|| format!("Failed to open bridge repository at {}", repo.display()))
}

async fn cmd_fetch(repo: &Path, bundle: PathBuf) -> Result<()> {
    let repository = Arc::new(open(repo)?);
    let remote = Arc::new(BundleFileRemote::new(&bundle));
    let orchestrator = Orchestrator::new(repository, remote);

    println!("Fetching from {}...", bundle.display());
    let report = orchestrator.fetch().await?;

    if report.is_up_to_date() {
        println!("Already up to date.");
        return Ok(());
    }

    println!("\nFetch completed:");
    println!("  Changesets: {}", report.changesets.len());
    println!("  Objects:    {}", report.summary.objects);
    println!("  Revisions:  {}", report.summary.revisions);
    println!("  Mappings:   {}", report.summary.mappings);
    if let Some((hg, git)) = report.changesets.last() {
        println!("  Tip:        {} -> {}", hg, git);
    }
    print_skipped(&report.skipped);
    Ok(())
}

async fn cmd_push(repo: &Path, outbox: PathBuf, heads: Vec<String>) -> Result<()> {
    let heads = heads
        .iter()
        .map(|h| GitId::from_hex(h).with_context(|| format!("Invalid git head {}", h)))
        .collect::<Result<Vec<_>>>()?;

    let repository = Arc::new(open(repo)?);
    let remote = Arc::new(BundleFileRemote::outbox(&outbox));
    let orchestrator = Orchestrator::new(repository, remote);

    println!("Pushing {} head(s) to {}...", heads.len(), outbox.display());
    let report = orchestrator.push(&heads).await?;

    if report.is_up_to_date() {
        println!("Nothing to push.");
        return Ok(());
    }

    println!("\nPush completed:");
    println!("  Commits:   {}", report.commits.len());
    println!("  Revisions: {}", report.summary.revisions);
    println!("  Bundle:    {}", format_size(report.bundle_bytes as u64));
    for (git, hg) in &report.commits {
        println!("  {} -> {}", git, hg);
    }
    print_skipped(&report.skipped);
    Ok(())
}

fn print_skipped(skipped: &[hgbridge_core::SkippedEntry]) {
    if skipped.is_empty() {
        return;
    }
    println!("\nSkipped {} entries:", skipped.len());
    for entry in skipped {
        println!("  {}: {}", String::from_utf8_lossy(&entry.path), entry.reason);
    }
}

fn cmd_fsck(repo: &Path) -> Result<()> {
    let repository = open(repo)?;
    let report = repository.mapping().audit()?;

    println!("Checking {}...", repository.mapping().path().display());
    println!("  Records:    {}", report.records);
    println!("  Real:       {}", report.real);
    println!("  Synthetic:  {}", report.synthetic);

    for (hg, first, second) in &report.forward_conflicts {
        println!("  CONFLICT hg {} -> {} and {}", hg, first, second);
    }
    for (git, first, second) in &report.reverse_conflicts {
        println!("  CONFLICT git {} <- {} and {}", git, first, second);
    }
    for entry in &report.dangling_synthetic {
        println!("  DANGLING synthetic {} -> {}", entry.hg, entry.git);
    }

    if repository.state().sync_in_progress {
        println!("  Note: an interrupted sync left no committed work; rerun it.");
    }

    if !report.is_clean() {
        return Err(anyhow!("Correspondence log check failed!"));
    }
    println!("OK");
    Ok(())
}

fn cmd_info(repo: &Path) -> Result<()> {
    let repository = open(repo)?;
    let state = repository.state();
    let config = repository.config();

    println!("Repository: {}", repo.display());
    println!("UUID:       {}", repository.uuid());
    println!("Mappings:   {}", repository.mapping().len());

    println!("\nSync State:");
    if state.remote_url.is_empty() {
        println!("  No sync yet.");
    } else {
        println!("  Remote:           {}", state.remote_url);
        println!("  Known heads:      {}", state.hg_heads.len());
        for head in &state.hg_heads {
            println!("    {}", head);
        }
        println!("  Total fetched:    {}", state.total_fetched);
        println!("  Total pushed:     {}", state.total_pushed);
        println!("  In progress:      {}", state.sync_in_progress);
        if state.last_sync_timestamp > 0 {
            let date = chrono::DateTime::from_timestamp(state.last_sync_timestamp, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| state.last_sync_timestamp.to_string());
            println!("  Last sync time:   {}", date);
        }
    }

    println!("\nConfiguration:");
    println!("  Worker threads:   {}", config.worker_threads);
    println!("  Skip bad modes:   {}", config.skip_unsupported_modes);
    println!("  Index retries:    {}", config.index_write_retries);
    println!("  Transport retries:{:>2}", config.transport_retries);
    println!("  Batch timeout:    {}s", config.batch_timeout_secs);
    println!("  Verify hashes:    {}", config.verify_hashes);

    if let Some(entry) = repository.sync_log().latest()? {
        println!("\nLatest Sync:");
        println!("  {}", sync_log::format_entry(&entry));
    }

    Ok(())
}

fn cmd_log(repo: &Path, limit: Option<usize>, cleanup_days: Option<u32>) -> Result<()> {
    if let Some(days) = cleanup_days {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
        let removed = hgbridge_core::SyncLog::new(repo).cleanup_before(cutoff.timestamp_millis())?;
        println!("Removed {} sync log entries older than {} days.", removed, days);
    }
    sync_log::print_sync_log(repo, limit, &mut std::io::stdout())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
