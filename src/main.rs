//! # File Indexer CLI (`fidx`)
//!
//! Walks the configured data sources and routes every file through the
//! configured handler plugins, storing what they extract in SQLite.
//!
//! ## Usage
//!
//! ```bash
//! fidx --config ./config/fidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fidx init` | Create the database files and every handler's tables |
//! | `fidx plan` | Print the handler execution plan |
//! | `fidx sources` | List data sources and whether they can be reached |
//! | `fidx run` | Crawl every data source once |
//! | `fidx completions <shell>` | Print a shell completion script |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Run complete, or partial success (see the summary) |
//! | 2 | Configuration or plan failure, nothing was crawled |
//! | 3 | The store became unavailable mid-run |
//! | 1 | Anything else |

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use file_indexer::backend::BackendRegistry;
use file_indexer::config::{self, Config};
use file_indexer::crawl;
use file_indexer::dispatch::StopHandle;
use file_indexer::error::{find_indexer_error, IndexerError};
use file_indexer::logging;
use file_indexer::progress::ProgressMode;
use file_indexer::sources;
use file_indexer::traits::PluginRegistry;

/// File indexer: a pluggable crawler that stores file metadata in SQLite.
#[derive(Parser)]
#[command(
    name = "fidx",
    about = "A pluggable file-indexing crawler",
    version,
    long_about = "fidx walks local (and pluggable remote) data sources, sniffs each file's \
    mime type and encoding, and runs an ordered set of handler plugins over it. Handlers \
    persist what they extract (hashes, audio tags, document metadata) into one SQLite \
    schema each."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fidx.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Crawl progress on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database files and every handler's tables.
    ///
    /// Idempotent: running it again leaves existing data untouched.
    Init,

    /// Print the execution plan: which handlers run in which step.
    ///
    /// Works without a configuration file, using the built-in defaults.
    Plan,

    /// List data sources, their backend and health.
    Sources,

    /// Crawl every data source once.
    ///
    /// Ctrl-C requests a stop: no new work is started and in-flight work
    /// finishes before the summary is printed.
    Run,

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = find_indexer_error(&err).map_or(1, IndexerError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let registry = PluginRegistry::with_builtins();

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "fidx", &mut std::io::stdout());
        }
        Commands::Plan => {
            let cfg = config::load_config(&cli.config)
                .unwrap_or_else(|_| Config::minimal("./data"));
            crawl::show_plan(&cfg, &registry)?;
        }
        Commands::Init => {
            let cfg = load(&cli.config)?;
            crawl::run_init(&cfg, &registry).await?;
        }
        Commands::Sources => {
            let cfg = load(&cli.config)?;
            sources::list_sources(&cfg, &BackendRegistry::with_builtins())?;
        }
        Commands::Run => {
            let cfg = Arc::new(load(&cli.config)?);
            let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

            let stop = StopHandle::new();
            let on_signal = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.request_stop();
                }
            });

            crawl::run_crawl(cfg, &registry, stop, Arc::from(progress.reporter())).await?;
        }
    }

    Ok(())
}

/// Configuration errors exit with status 2.
fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    config::load_config(path).map_err(|e| {
        anyhow::Error::new(IndexerError::Config(format!("{:#}", e)))
    })
}
