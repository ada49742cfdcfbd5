//! checkd CLI - analysis daemon for Python projects.
//!
//! Usage:
//!   checkd start                      # Run the server in the foreground
//!   checkd start --save state.bin     # ... and snapshot once initialized
//!   checkd start --load state.bin --changed-files changed.txt
//!   checkd check                      # Print current diagnostics
//!   checkd query pkg.mod.name         # Type of a qualified name
//!   checkd notify a.py b.py           # Report edited files
//!   checkd subscribe                  # Stream diagnostics after rechecks
//!   checkd stop                       # Graceful shutdown

use anyhow::{Context, Result};
use checkd::config::ProjectFile;
use checkd::daemon::{paths, server, DaemonClient};
use checkd::{
    log, CheckdError, Configuration, PythonAnalyzer, SavedStateAction, ServerConfiguration,
    WatcherKind,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "checkd")]
#[command(about = "checkd - incremental analysis daemon with saved-state restore", long_about = None)]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Module search path, relative to the root (repeatable)
    #[arg(long = "search-path")]
    search_paths: Vec<PathBuf>,

    /// Report missing annotations
    #[arg(long)]
    strict: bool,

    /// Connection attempts before giving up
    #[arg(long, default_value = "20")]
    retries: usize,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Start {
        /// Write a snapshot once initialization completes
        #[arg(long, conflicts_with = "load")]
        save: Option<PathBuf>,

        /// Restore from a snapshot instead of analyzing from scratch
        #[arg(long)]
        load: Option<PathBuf>,

        /// Files changed since the snapshot, one path per line
        #[arg(long, requires = "load")]
        changed_files: Option<PathBuf>,

        /// File watcher: none or native
        #[arg(long)]
        watcher: Option<WatcherKind>,

        /// External watcher printing one changed path per line
        #[arg(long, num_args = 1.., allow_hyphen_values = true, conflicts_with = "watcher")]
        watcher_command: Option<Vec<String>>,

        /// Grace period for in-flight requests on shutdown
        #[arg(long, default_value = "500")]
        grace_ms: u64,
    },

    /// Stop the running server
    Stop,

    /// Show server status
    Status,

    /// Print current diagnostics
    Check,

    /// Show the type of a qualified name (pkg.mod.name)
    Query {
        expression: String,
    },

    /// Report changed files and wait for the recheck
    Notify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Save the server's current state
    Save {
        path: PathBuf,
    },

    /// Print diagnostics every time the server rechecks
    Subscribe,

    /// Print the rendezvous paths for this project
    Paths,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<CheckdError>()
                .map(CheckdError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Configuration::discover(&cli.root)
        .with_context(|| format!("cannot open project at {}", cli.root.display()))?
        .with_search_paths(cli.search_paths.clone());
    let config = if cli.strict {
        config.with_strict(true)
    } else {
        config
    };

    if !matches!(cli.command, Commands::Start { .. }) {
        log::init_stderr(cli.verbose);
    }
    let socket = paths::socket_path(&config, false)?;

    match cli.command {
        Commands::Start {
            save,
            load,
            changed_files,
            watcher,
            watcher_command,
            grace_ms,
        } => {
            let watcher = match (watcher_command, watcher) {
                (Some(argv), _) => WatcherKind::Command(argv),
                (None, Some(kind)) => kind,
                (None, None) => ProjectFile::load(&config.project_root)?
                    .map(|file| file.watcher_kind())
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            };
            let saved_state = match (save, load) {
                (Some(path), _) => SavedStateAction::Save(absolute(&path)?),
                (None, Some(snapshot)) => SavedStateAction::Load {
                    snapshot: absolute(&snapshot)?,
                    changed_files: changed_files.as_deref().map(absolute).transpose()?,
                },
                (None, None) => SavedStateAction::None,
            };
            return start(config, saved_state, watcher, Duration::from_millis(grace_ms)).await;
        }

        Commands::Paths => {
            println!("socket      {}", socket.display());
            println!("lock        {}", paths::lock_path(&config, false)?.display());
            println!("pid         {}", paths::pid_path(&config, false)?.display());
            println!("log         {}", paths::log_path(&config, false)?.display());
            println!("saved state {}", paths::saved_state_path(&config, false)?.display());
        }

        Commands::Stop => {
            let mut client = connect(&socket, cli.retries).await?;
            client.stop().await?;
            println!("Server stopping");
        }

        Commands::Status => {
            let mut client = connect(&socket, cli.retries).await?;
            let status = client.status().await?;
            println!("pid          {}", status.pid);
            println!("root         {}", status.project_root.display());
            if let Some(socket) = &status.socket {
                println!("socket       {}", socket.display());
            }
            println!("started      {}", status.started_at.to_rfc3339());
            println!("uptime       {}s", status.uptime_secs);
            println!("files        {}", status.files);
            println!("diagnostics  {}", status.diagnostics);
            println!("subscribers  {}", status.persistent_clients);
            println!("notifiers    {}", status.file_notifiers);
            match status.watcher_pid {
                Some(pid) => println!("watcher pid  {pid}"),
                None => println!("watcher pid  -"),
            }
            println!("fingerprint  {}", status.fingerprint);
        }

        Commands::Check => {
            let mut client = connect(&socket, cli.retries).await?;
            let diagnostics = client.flush_diagnostics().await?;
            for diagnostic in &diagnostics {
                println!("{}", display_relative(&config, diagnostic));
            }
            if diagnostics.is_empty() {
                println!("No errors found");
                return Ok(0);
            }
            println!("Found {} error(s)", diagnostics.len());
            return Ok(1);
        }

        Commands::Query { expression } => {
            let mut client = connect(&socket, cli.retries).await?;
            let info = client.type_query(&expression).await?;
            print!("{}: {}", info.expression, info.type_name);
            if let (Some(path), Some(line)) = (&info.path, info.line) {
                print!("  ({}:{})", relative(&config, path).display(), line);
            }
            println!();
        }

        Commands::Notify { paths } => {
            let mut client = connect(&socket, cli.retries).await?;
            let paths = paths
                .iter()
                .map(|p| absolute(p))
                .collect::<Result<Vec<_>>>()?;
            let count = paths.len();
            client.file_changed(paths).await?;
            println!("Rechecked {count} file(s)");
        }

        Commands::Save { path } => {
            let mut client = connect(&socket, cli.retries).await?;
            let path = absolute(&path)?;
            client.save_state(&path).await?;
            println!("Saved state to {}", path.display());
        }

        Commands::Subscribe => {
            let mut client = connect(&socket, cli.retries).await?;
            let id = client.subscribe().await?;
            eprintln!("Subscribed as {id}");
            while let Some(diagnostics) = client.next_push().await? {
                println!("--- {} diagnostic(s)", diagnostics.len());
                for diagnostic in &diagnostics {
                    println!("{}", display_relative(&config, diagnostic));
                }
            }
            eprintln!("Server closed the connection");
        }
    }

    Ok(0)
}

async fn start(
    config: Configuration,
    saved_state: SavedStateAction,
    watcher: WatcherKind,
    grace_period: Duration,
) -> Result<i32> {
    log::init(&paths::log_path(&config, true)?)?;
    eprintln!(
        "Starting server for {} (logs: {})",
        config.project_root.display(),
        paths::log_path(&config, false)?.display()
    );

    let mut server_config = ServerConfiguration::new(config)
        .with_saved_state(saved_state)
        .with_watcher(watcher);
    server_config.grace_period = grace_period;

    match server::run(server_config, Arc::new(PythonAnalyzer::new())).await {
        Ok(()) => Ok(0),
        Err(e) if e.is_snapshot_rejection() => {
            eprintln!("The saved state cannot be used; start again without --load.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn connect(socket: &Path, retries: usize) -> Result<DaemonClient> {
    match DaemonClient::connect_with(socket, retries, Duration::from_millis(100)).await {
        Ok(client) => Ok(client),
        Err(e @ CheckdError::ConnectionFailure { .. }) => {
            eprintln!("Is the server running? Start it with `checkd start`.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn relative<'a>(config: &Configuration, path: &'a Path) -> &'a Path {
    path.strip_prefix(&config.project_root).unwrap_or(path)
}

fn display_relative(config: &Configuration, diagnostic: &checkd::Diagnostic) -> String {
    let mut shown = diagnostic.clone();
    shown.path = relative(config, &diagnostic.path).to_path_buf();
    shown.to_string()
}
