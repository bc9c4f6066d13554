//! meshd
//!
//! Daemon wrapper around the taskmesh engine: loads configuration from
//! the environment, recovers state from the data directory, and runs the
//! scheduler until interrupted.
//!
//! Exit codes: 0 success, 1 configuration error, 2 recovery failed,
//! 3 underlying store unreachable.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskmesh::dispatch::LlmDispatcher;
use taskmesh::store::DurableStore;
use taskmesh::{BootError, Engine, MeshConfig, ProvidersFile};

const EXIT_CONFIG: u8 = 1;
const EXIT_RECOVERY: u8 = 2;
const EXIT_STORE: u8 = 3;

#[derive(Parser)]
#[command(name = "meshd", about = "taskmesh scheduling daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted.
    Run {
        /// Providers/modes YAML file.
        #[arg(long, env = "MESH_PROVIDERS_FILE")]
        providers: Option<PathBuf>,
    },
    /// Validate configuration and the providers file, then exit.
    CheckConfig {
        #[arg(long, env = "MESH_PROVIDERS_FILE")]
        providers: Option<PathBuf>,
    },
    /// List usable restore points in the data directory.
    RestorePoints,
}

fn load_providers(path: &Option<PathBuf>) -> Result<ProvidersFile, taskmesh::ConfigError> {
    match path {
        Some(path) => ProvidersFile::load(path),
        None => Ok(ProvidersFile::default()),
    }
}

fn boot_exit_code(err: &BootError) -> u8 {
    match err {
        BootError::Config(_) => EXIT_CONFIG,
        BootError::Recovery(_) => EXIT_RECOVERY,
        BootError::Store(_) => EXIT_STORE,
    }
}

async fn run(providers_path: Option<PathBuf>) -> ExitCode {
    let config = match MeshConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let providers = match load_providers(&providers_path) {
        Ok(providers) => providers,
        Err(e) => {
            error!(error = %e, "Invalid providers file");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let dispatcher = match LlmDispatcher::new(&providers.providers) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            error!(error = %e, "Provider client setup failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match Engine::start(config, providers, dispatcher).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Engine failed to start");
            return ExitCode::from(boot_exit_code(&e));
        }
    };
    info!("meshd running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handling failed");
    }
    info!("Shutting down");
    match runtime.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Scheduler halted on store failure");
            ExitCode::from(EXIT_STORE)
        }
    }
}

async fn check_config(providers_path: Option<PathBuf>) -> ExitCode {
    match (MeshConfig::from_env(), load_providers(&providers_path)) {
        (Ok(config), Ok(providers)) => {
            println!(
                "configuration ok: data_dir={}, {} providers, {} modes",
                config.data_dir.display(),
                providers.providers.len(),
                providers.effective_modes().len()
            );
            ExitCode::SUCCESS
        }
        (Err(e), _) => {
            error!(error = %e, "Invalid configuration");
            ExitCode::from(EXIT_CONFIG)
        }
        (_, Err(e)) => {
            error!(error = %e, "Invalid providers file");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn restore_points() -> ExitCode {
    let config = match MeshConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let store = match DurableStore::open(&config.data_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Cannot open store");
            return ExitCode::from(EXIT_STORE);
        }
    };
    match store.list_snapshots().await {
        Ok(snapshots) if snapshots.is_empty() => {
            println!("no restore points");
            ExitCode::SUCCESS
        }
        Ok(snapshots) => {
            for meta in snapshots {
                println!(
                    "{}  seq={}  created={}",
                    meta.name, meta.last_seq, meta.created_at
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Cannot list snapshots");
            ExitCode::from(EXIT_STORE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { providers } => run(providers).await,
        Commands::CheckConfig { providers } => check_config(providers).await,
        Commands::RestorePoints => restore_points().await,
    }
}
