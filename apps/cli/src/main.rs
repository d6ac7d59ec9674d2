//! hubdl CLI - fetch hub repositories from the command line
//!
//! Also the worker process: `hubdl worker` runs one task and reports
//! progress on stdout.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hubdl_core::HubdlError;
use hubdl_types::{Backend, DuplicateAction, PatternPreset, RepoKind};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LONG_ABOUT: &str = "\
hubdl - Hub Repository Downloader

One hubdl process at a time drives a data directory. While another one is
running (say, a `get` in a second terminal), `list`, `info`, `config show`
and `config get` print the stored state without touching it; every other
command fails until that process exits.";

/// hubdl - Hub Repository Downloader
#[derive(Parser)]
#[command(name = "hubdl")]
#[command(author, version, about, long_about = LONG_ABOUT)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for hubdl
    #[arg(long, env = "HUBDL_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// What to download and where
#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Repository id, e.g. `org/model`
    repo: String,

    /// Repository kind (model, dataset, space)
    #[arg(short, long, default_value = "model")]
    kind: RepoKind,

    /// Branch, tag, or commit
    #[arg(short, long, default_value = "main")]
    revision: String,

    /// Only fetch files matching these globs
    #[arg(short, long)]
    include: Vec<String>,

    /// Skip files matching these globs
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Pattern preset (safetensors_only, gguf_only, no_pytorch, config_only)
    #[arg(long)]
    preset: Option<PatternPreset>,

    /// Base directory; files land in `<dir>/<kind>s--<org>--<name>`
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// What to do when the target directory is taken (check, overwrite, rename)
    #[arg(long, default_value = "check")]
    on_duplicate: DuplicateAction,

    /// Execution backend (isolated_process, accelerator)
    #[arg(long)]
    backend: Option<Backend>,

    /// Ask the worker for its accelerated transfer mode
    #[arg(long)]
    accelerated: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a download without starting it
    Add(RepoArgs),

    /// Queue a download, start it, and wait for it to finish
    Get(RepoArgs),

    /// Start queued tasks and watch them
    Start {
        /// Task IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Resume paused or failed tasks and watch them
    Resume {
        /// Task IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Pause a task
    Pause {
        /// Task ID
        id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task ID
        id: String,
    },

    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show task info
    Info {
        /// Task ID
        id: String,
    },

    /// Remove a task
    Remove {
        /// Task ID
        id: String,

        /// Also delete the downloaded files
        #[arg(long)]
        with_files: bool,
    },

    /// Remove completed, failed, and cancelled tasks
    Clear,

    /// Check a task's files against the published hashes
    Verify {
        /// Task ID
        id: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },

    /// Run one task as a worker process (internal)
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key, e.g. `transfer_workers` or `accelerator.split`
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value (JSON, or a plain string)
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "warn,hubdl=info,hubdl_core=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // The worker talks on stdout; it never opens the registry
    if let Commands::Worker = cli.command {
        hubdl_core::run_stdio().await?;
        return Ok(());
    }

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "hubdl", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(hubdl_types::default_data_dir);

    // Initialize core
    let core = match hubdl_core::HubdlCore::new(data_dir.clone()).await {
        Ok(core) => core,
        Err(busy @ HubdlError::DataDirBusy { .. }) => {
            return run_read_only(&data_dir, busy, cli.command, cli.output).await;
        }
        Err(e) => return Err(e.into()),
    };

    let result = match cli.command {
        Commands::Add(args) => commands::add_task(&core, args, false, cli.output).await,
        Commands::Get(args) => commands::add_task(&core, args, true, cli.output).await,
        Commands::Start { ids } | Commands::Resume { ids } => {
            commands::start_tasks(&core, ids, cli.output).await
        }
        Commands::Pause { id } => commands::pause_task(&core, &id, cli.output).await,
        Commands::Cancel { id } => commands::cancel_task(&core, &id, cli.output).await,
        Commands::List { status, all } => commands::list_tasks(core.tasks(), status, all, cli.output),
        Commands::Info { id } => commands::show_info(core.get_task(&id), &id, cli.output),
        Commands::Remove { id, with_files } => {
            commands::remove_task(&core, &id, with_files, cli.output).await
        }
        Commands::Clear => commands::clear_completed(&core, cli.output),
        Commands::Verify { id } => commands::verify_task(&core, &id, cli.output).await,
        Commands::Config { action } => commands::config_action(&core, action, cli.output).await,
        Commands::Completions { .. } | Commands::Worker => Ok(()),
    };

    core.shutdown().await;
    result
}

/// Answer from stored state while another process holds the data directory
async fn run_read_only(data_dir: &Path, busy: HubdlError, command: Commands, output: OutputFormat) -> Result<()> {
    let read_only = matches!(
        command,
        Commands::List { .. }
            | Commands::Info { .. }
            | Commands::Config {
                action: None | Some(ConfigAction::Show | ConfigAction::Get { .. })
            }
    );
    if !read_only {
        return Err(busy.into());
    }

    eprintln!("{}; showing stored state", busy);
    let snapshot = hubdl_core::read_snapshot(data_dir.to_path_buf()).await?;
    match command {
        Commands::List { status, all } => commands::list_tasks(snapshot.tasks, status, all, output),
        Commands::Info { id } => {
            let task = snapshot.tasks.into_iter().find(|t| t.id == id);
            commands::show_info(task, &id, output)
        }
        Commands::Config {
            action: Some(ConfigAction::Get { key }),
        } => commands::get_config(&snapshot.settings, &key),
        Commands::Config { .. } => commands::show_config(&snapshot.settings, data_dir, output),
        _ => Err(busy.into()),
    }
}
