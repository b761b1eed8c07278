use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use nimbus_cache::NodeCache;
use nimbus_config::Config;
use nimbus_remote::RemoteClient;
use nimbus_remote::api::{HttpApi, HttpOptions};
use nimbus_sync::SyncController;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod commands;
mod error;
mod logging;

#[derive(Parser)]
#[command(name = "nimbus", version, about = "Mirror a cloud drive's tree into a local cache and operate on it")]
struct Cli {
    /// Path to config file [default: ~/.config/nimbus/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull the remote change log into the local cache
    Sync,
    /// Show the cache's checkpoint, last sync time and size
    Status,
    /// List a remote folder (or show a single file)
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// List every node whose name matches a regular expression
    Find { pattern: String },
    /// Create a remote folder; its parent must already exist
    Mkdir { path: String },
    /// Upload a local file into a remote folder
    Upload { local: PathBuf, remote_dir: String },
    /// Download a remote file and verify its MD5
    Download { remote: String, local: PathBuf },
    /// Move a remote node to the trash
    Trash { path: String },
}

async fn open(config: &Config) -> Result<SyncController> {
    std::fs::create_dir_all(&config.auth_path).or_raise(|| ErrorKind::LocalIo(config.auth_path.clone()))?;
    let cache = NodeCache::open(config.cache_path(), config.cache.workers).await.or_raise(|| ErrorKind::Startup)?;
    let options = HttpOptions {
        metadata_url: config.remote.metadata_url.clone(),
        content_url: config.remote.content_url.clone(),
        timeout: config.timeout(),
        connect_timeout: config.connect_timeout(),
    };
    let api = HttpApi::new(&config.auth_path, options).or_raise(|| ErrorKind::Startup)?;
    let remote = RemoteClient::new(Arc::new(api)).or_raise(|| ErrorKind::Startup)?;
    Ok(SyncController::new(cache, remote))
}

async fn run(command: Command, controller: &SyncController) -> Result<()> {
    match command {
        Command::Sync => commands::sync(controller).await,
        Command::Status => commands::status(controller).await,
        Command::Ls { path } => commands::ls(controller, &path).await,
        Command::Find { pattern } => commands::find(controller, &pattern).await,
        Command::Mkdir { path } => commands::mkdir(controller, &path).await,
        Command::Upload { local, remote_dir } => commands::upload(controller, &local, &remote_dir).await,
        Command::Download { remote, local } => commands::download(controller, &remote, &local).await,
        Command::Trash { path } => commands::trash(controller, &path).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config) {
        Ok(config) => config,
        Err(error) => {
            // Logging isn't configured yet.
            eprintln!("{error:?}");
            return ExitCode::FAILURE;
        },
    };
    logging::init(&config.log, cli.verbose);

    let controller = match open(&config).await {
        Ok(controller) => controller,
        Err(error) => {
            tracing::error!(?error, "startup failed");
            return ExitCode::FAILURE;
        },
    };
    let result = run(cli.command, &controller).await;
    controller.close().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(?error, "{}", *error);
            ExitCode::FAILURE
        },
    }
}
