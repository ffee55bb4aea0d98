//! CLI entry point for stash-ingest.
//!
//! This binary scans media libraries into a repository snapshot, keeps it
//! up to date by watching the libraries, and fills in checksums.
//!
//! # Usage
//!
//! ```bash
//! stash-ingest [OPTIONS] <COMMAND>
//!
//! # Scan every configured library
//! stash-ingest --config stash.json scan
//!
//! # Scan one folder of an ad-hoc library
//! stash-ingest --library /media/videos scan /media/videos/new
//!
//! # Watch libraries and rescan changed paths
//! stash-ingest --config stash.json watch
//!
//! # Compute missing checksums
//! stash-ingest --config stash.json hash
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{WrapErr, eyre};
use si_core::{Config, ConfigError, LibraryConfig};
use si_jobs::{HashJob, JobEvent, JobId, JobInfo, JobManager, JobStatus, ReadLockManager, ScanJob};
use si_scanner::fs::{FileSystem, OsFs};
use si_scanner::repository::{MemoryRepository, Repository};
use si_scanner::{ScanOptions, Scanner, StatsSnapshot};
use si_watcher::{EventRouter, LibraryWatcher, ScanTrigger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Media library ingestion: scan, watch, and fingerprint.
#[derive(Parser)]
#[command(name = "stash-ingest", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "STASH_INGEST_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Library root to add to the configured ones. Repeatable.
    #[arg(
        short,
        long = "library",
        global = true,
        env = "STASH_INGEST_LIBRARIES",
        value_delimiter = ','
    )]
    libraries: Vec<Utf8PathBuf>,

    /// Repository snapshot read before and written after each command.
    #[arg(
        short,
        long,
        global = true,
        env = "STASH_INGEST_DATABASE",
        default_value = "stash-ingest.json"
    )]
    database: Utf8PathBuf,

    /// Number of files fingerprinted concurrently.
    #[arg(short, long, global = true, env = "STASH_INGEST_PARALLEL")]
    parallel: Option<usize>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Scan libraries, or only the given paths, into the repository.
    Scan {
        /// Paths to scan. Empty scans every library.
        paths: Vec<Utf8PathBuf>,

        /// Recompute fingerprints of files whose size and mtime are unchanged.
        #[arg(long)]
        force: bool,

        /// Recompute fingerprints last computed before this Unix time.
        #[arg(long, value_name = "UNIX_SECONDS")]
        fingerprint_cutoff: Option<i64>,

        /// Compute BLAKE3 checksums during the scan.
        #[arg(long)]
        checksum: bool,

        /// Print statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Scan once, then watch libraries and rescan changed paths.
    Watch {
        /// Quiet period before a changed path is scanned.
        #[arg(long, env = "STASH_INGEST_DEBOUNCE_MS")]
        debounce_ms: Option<u64>,

        /// Skip the initial full scan.
        #[arg(long)]
        no_initial_scan: bool,
    },

    /// Compute missing checksums for stored files.
    Hash {
        /// Recompute existing checksums too.
        #[arg(long)]
        overwrite: bool,
    },

    /// Inspect or create configuration files.
    Config {
        /// Configuration action.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,

    /// Write a default configuration file.
    Init {
        /// Destination file.
        path: Utf8PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// The `notify` backend is filtered to `warn` level.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},notify=warn"))
    });

    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_ansi(use_ansi))
        .with(filter)
        .init();
}

/// Builds the effective [`Config`]: file, then CLI and environment overrides.
///
/// # Errors
///
/// Returns an error if the file can't be loaded, a `--library` doesn't exist,
/// or the result fails validation.
fn build_config(cli: &Cli) -> color_eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            Config::load(path).wrap_err_with(|| format!("failed to load configuration {path}"))?
        }
        None => Config::default(),
    };

    for path in &cli.libraries {
        let root = path
            .canonicalize_utf8()
            .map_err(|_| ConfigError::MissingDirectory(path.clone()))?;
        if !config.libraries.iter().any(|lib| lib.path == root) {
            config.libraries.push(LibraryConfig::new(root));
        }
    }
    if let Some(parallel) = cli.parallel {
        config.scan.parallel_tasks = Some(parallel);
    }

    config.validate()?;
    Ok(config)
}

/// Shared services for commands that touch the repository.
struct Services {
    repo: Arc<MemoryRepository>,
    fs: Arc<dyn FileSystem>,
    locks: ReadLockManager,
    scanner: Scanner,
    manager: JobManager,
    database: Utf8PathBuf,
}

impl Services {
    fn open(config: &Config, database: &Utf8Path) -> color_eyre::Result<Self> {
        let repo = Arc::new(
            MemoryRepository::load(database)
                .wrap_err_with(|| format!("failed to load repository snapshot {database}"))?,
        );
        info!(
            path = %database,
            files = repo.file_count(),
            folders = repo.folder_count(),
            "Repository loaded"
        );

        let fs: Arc<dyn FileSystem> = Arc::new(OsFs);
        let locks = ReadLockManager::new();
        let scanner = Scanner::new(
            Arc::clone(&fs),
            Arc::clone(&repo) as Arc<dyn Repository>,
            config.scan.clone(),
        )
        .with_libraries(config.libraries.clone())
        .with_read_locks(locks.clone());

        Ok(Self {
            repo,
            fs,
            locks,
            scanner,
            manager: JobManager::new(config.jobs.clone()),
            database: database.to_owned(),
        })
    }

    fn submit_scan(&self, options: ScanOptions) -> JobId {
        submit_scan(&self.manager, &self.scanner, options)
    }

    fn save(&self) -> color_eyre::Result<()> {
        self.repo
            .save(&self.database)
            .wrap_err_with(|| format!("failed to write repository snapshot {}", self.database))?;
        info!(path = %self.database, files = self.repo.file_count(), "Repository saved");
        Ok(())
    }
}

fn submit_scan(manager: &JobManager, scanner: &Scanner, options: ScanOptions) -> JobId {
    let job = ScanJob::new(scanner.clone(), options);
    manager.add(job.description(), |ctx| job.run(ctx))
}

/// Waits for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> color_eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// Runs a one-shot scan and prints statistics.
///
/// # Errors
///
/// Returns an error if the scan job fails or the snapshot can't be written.
async fn run_scan(
    mut config: Config,
    database: &Utf8Path,
    options: ScanOptions,
    checksum: bool,
    json: bool,
) -> color_eyre::Result<()> {
    config.scan.calculate_checksum |= checksum;
    if config.libraries.is_empty() && options.paths.is_empty() {
        return Err(eyre!(
            "no libraries configured; pass --library or a configuration file"
        ));
    }

    let services = Services::open(&config, database)?;
    let id = services.submit_scan(options);
    let info = services.manager.wait(id).await?;
    services.manager.shutdown().await;

    let stats = services.scanner.stats();
    if json {
        print_json(&stats)?;
    } else {
        print_stats_summary(&stats);
    }

    match info.status {
        JobStatus::Completed => services.save(),
        JobStatus::Cancelled => Err(eyre!("scan cancelled")),
        _ => Err(eyre!(
            "scan failed: {}",
            info.error.unwrap_or_else(|| "unknown error".to_owned())
        )),
    }
}

/// Scans once, then watches until interrupted.
///
/// The snapshot is written after every finished job and on shutdown.
///
/// # Errors
///
/// Returns an error if the watcher can't start or the snapshot can't be
/// written.
async fn run_watch(
    mut config: Config,
    database: &Utf8Path,
    debounce_ms: Option<u64>,
    initial_scan: bool,
) -> color_eyre::Result<()> {
    if config.libraries.is_empty() {
        return Err(eyre!(
            "no libraries configured; pass --library or a configuration file"
        ));
    }
    if let Some(ms) = debounce_ms {
        config.watch.debounce_ms = ms;
    }
    config.watch.enabled = true;

    let services = Arc::new(Services::open(&config, database)?);
    info!(libraries = config.libraries.len(), "Starting watch");

    let token = CancellationToken::new();
    let mut events = services.manager.subscribe_events(token.clone());
    let saver_services = Arc::clone(&services);
    let saver = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Added(info) => debug!(job_id = %info.id, "{}", info.description),
                JobEvent::Updated(info) => debug!(
                    job_id = %info.id,
                    status = %info.status,
                    progress = info.progress,
                    "{}",
                    info.description
                ),
                JobEvent::Removed(info) => {
                    report_job(&info);
                    if let Err(e) = saver_services.save() {
                        warn!(error = %e, "Failed to save repository");
                    }
                }
            }
        }
    });

    if initial_scan {
        services.submit_scan(ScanOptions::default());
    }

    let trigger_services = Arc::clone(&services);
    let trigger: Arc<dyn ScanTrigger> = Arc::new(move |path: &Utf8Path| {
        trigger_services.submit_scan(ScanOptions {
            paths: vec![path.to_owned()],
            ..ScanOptions::default()
        });
    });

    let router = EventRouter::new(Arc::clone(&services.fs), &config.scan);
    let mut watcher = LibraryWatcher::new(config.watch.clone(), router, trigger);
    let roots = config.libraries.iter().map(|lib| lib.path.clone()).collect();
    watcher.start(roots).await?;

    shutdown_signal().await?;

    info!("Shutting down");
    watcher.stop().await;
    services.manager.shutdown().await;
    token.cancel();
    if let Err(e) = saver.await {
        warn!(error = %e, "Snapshot writer ended abnormally");
    }
    services.save()
}

/// Computes checksums for stored files.
///
/// # Errors
///
/// Returns an error if the job fails or the snapshot can't be written.
async fn run_hash(config: &Config, database: &Utf8Path, overwrite: bool) -> color_eyre::Result<()> {
    let services = Services::open(config, database)?;
    let job = HashJob::new(
        Arc::clone(&services.repo) as Arc<dyn Repository>,
        Arc::clone(&services.fs),
        services.locks.clone(),
        config.jobs.clone(),
    )
    .with_overwrite(overwrite);

    let id = services.manager.start("Generating checksums", |ctx| job.run(ctx));
    let info = services.manager.wait(id).await?;
    services.manager.shutdown().await;
    report_job(&info);

    match info.status {
        JobStatus::Completed => services.save(),
        _ => Err(eyre!(
            "checksum job {}: {}",
            info.status,
            info.error.unwrap_or_default()
        )),
    }
}

/// Prints or writes configuration.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
fn run_config(config: &Config, action: &ConfigAction) -> color_eyre::Result<()> {
    match action {
        ConfigAction::Show => print_json(config),
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                return Err(eyre!("{path} already exists; pass --force to overwrite"));
            }
            Config::default().save(path)?;
            info!(path = %path, "Configuration written");
            Ok(())
        }
    }
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Prints a summary of scan statistics.
fn print_stats_summary(stats: &StatsSnapshot) {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    let _ = writeln!(handle);
    let _ = writeln!(handle, "Scan Summary");
    let _ = writeln!(handle, "============");
    let _ = writeln!(handle);
    let _ = writeln!(handle, "Files seen:        {}", stats.files_seen());
    let _ = writeln!(handle, "  New:             {}", stats.new);
    let _ = writeln!(handle, "  Updated:         {}", stats.updated);
    let _ = writeln!(handle, "  Moved:           {}", stats.moved);
    let _ = writeln!(handle, "  Unchanged:       {}", stats.unchanged);
    let _ = writeln!(handle, "Folders created:   {}", stats.folders_created);
    let _ = writeln!(handle, "Folders moved:     {}", stats.folders_moved);
    let _ = writeln!(handle, "Missing:           {}", stats.missing);
    let _ = writeln!(handle, "Errors:            {}", stats.errors);
    let _ = writeln!(handle);
    let _ = writeln!(handle, "Success rate: {:.1}%", stats.success_rate());
}

/// Prints a value as pretty JSON.
fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> color_eyre::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| eyre!("Failed to serialize JSON: {}", e))?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{json}")?;
    Ok(())
}

/// Logs the outcome of a finished job.
fn report_job(info: &JobInfo) {
    let elapsed = info
        .start_time
        .zip(info.end_time)
        .and_then(|(start, end)| end.duration_since(start).ok())
        .unwrap_or_default();
    info!(
        job_id = %info.id,
        status = %info.status,
        elapsed_ms = elapsed.as_millis(),
        "{}",
        info.description
    );
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Resolve configuration
    let config = build_config(&cli)?;

    // 5. Route to appropriate command
    match &cli.command {
        Commands::Scan {
            paths,
            force,
            fingerprint_cutoff,
            checksum,
            json,
        } => {
            let options = ScanOptions {
                paths: paths
                    .iter()
                    .map(|p| p.canonicalize_utf8().unwrap_or_else(|_| p.clone()))
                    .collect(),
                force_rescan: *force,
                fingerprint_cutoff: *fingerprint_cutoff,
                ..ScanOptions::default()
            };
            run_scan(config, &cli.database, options, *checksum, *json).await
        }
        Commands::Watch {
            debounce_ms,
            no_initial_scan,
        } => run_watch(config, &cli.database, *debounce_ms, !no_initial_scan).await,
        Commands::Hash { overwrite } => run_hash(&config, &cli.database, *overwrite).await,
        Commands::Config { action } => run_config(&config, action),
    }
}
