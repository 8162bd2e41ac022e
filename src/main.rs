//! davsync: a WebDAV client with one-way directory synchronization.

use clap::{Parser, Subcommand};
use davsync_lib::commands::resource::{self, ResourceCommand};
use davsync_lib::commands::sync::{self, SyncArgs};
use davsync_lib::commands::{spawn_shutdown_handler, ConnectionArgs, Context};
use davsync_lib::config::{default_data_dir, AppConfig};
use davsync_lib::core::{Direction, SyncStatus};
use davsync_lib::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "davsync")]
#[command(version)]
#[command(about = "WebDAV client with one-way directory synchronization")]
#[command(after_long_help = r#"EXAMPLES
    Download a directory, adding only what is missing locally:
        $ davsync pull Photos ~/Pictures/cloud

    Make the server an exact copy of a local directory:
        $ davsync push --mode mirror ./site www

    See what a sync would do:
        $ davsync pull --dry-run Documents ./docs

CONFIGURATION
    Settings are read from config.json in the data directory
    (~/.config/davsync by default, see --config). Flags and DAVSYNC_*
    environment variables override the file.

EXIT STATUS
    0 when everything succeeded, 1 when some items failed or the sync could
    not start, 130 when cancelled with Ctrl-C.
"#)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Data directory holding config.json and the log file
    #[arg(long, global = true, env = "DAVSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Debug output on stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize a remote directory into a local one
    Pull(SyncArgs),
    /// Synchronize a local directory into a remote one
    Push(SyncArgs),
    #[command(flatten)]
    Resource(ResourceCommand),
}

fn exit_code(status: SyncStatus) -> ExitCode {
    match status {
        SyncStatus::Completed => ExitCode::SUCCESS,
        SyncStatus::CompletedWithFailures => ExitCode::from(1),
        SyncStatus::Cancelled => ExitCode::from(130),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let data_dir = cli.config.unwrap_or_else(default_data_dir);
    let config = AppConfig::load(&data_dir)?;
    logging::init(&config.log, &data_dir, cli.verbose);

    let ctx = Context::new(config, data_dir, &cli.connection);

    let (direction, args) = match cli.command {
        Commands::Pull(args) => (Direction::Pull, args),
        Commands::Push(args) => (Direction::Push, args),
        Commands::Resource(command) => {
            resource::run(&ctx, command).await?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());
    let status = sync::run(&ctx, direction, args, cancel).await?;
    Ok(exit_code(status))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
